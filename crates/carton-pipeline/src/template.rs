//! Template drivers.
//!
//! A template stage takes the current manifest stream and returns the next
//! one. `values` only writes the merged values file and passes the stream
//! through; `helmTemplate` renders a chart and replaces the stream.

use std::path::{Path, PathBuf};

use carton_core::{
    load_value_documents, merge_documents, HelmTemplateStep, KbldStep, TemplateStep, ValuesStep,
    YttStep,
};

use crate::error::{PipelineError, Result};
use crate::runner::CommandSpec;
use crate::stage::StageContext;
use crate::staging::write_file;

/// Run template stage `index` over `input`. The result is also written to
/// `template/<index>.yml`.
pub async fn run_template(
    ctx: &StageContext<'_>,
    index: usize,
    step: &TemplateStep,
    input: Vec<u8>,
) -> Result<Vec<u8>> {
    let output = match step {
        TemplateStep::Values(values) => {
            write_values(ctx, values).await?;
            input
        }
        TemplateStep::Ytt(ytt) => run_ytt(ctx, ytt, input).await?,
        TemplateStep::Kbld(kbld) => run_kbld(ctx, kbld, input).await?,
        TemplateStep::HelmTemplate(helm) => run_helm_template(ctx, helm).await?,
    };
    write_file(&ctx.staging.template_output(index), &output)?;
    Ok(output)
}

async fn write_values(ctx: &StageContext<'_>, step: &ValuesStep) -> Result<()> {
    let documents =
        load_value_documents(ctx.store, &ctx.spec.namespace, &step.sources, ctx.retry).await?;
    let merged = merge_documents(&documents)?;
    let rendered = serde_yaml::to_string(&merged)?;
    write_file(&ctx.staging.values_file(), rendered.as_bytes())?;
    Ok(())
}

async fn run_ytt(ctx: &StageContext<'_>, step: &YttStep, input: Vec<u8>) -> Result<Vec<u8>> {
    let mut command = CommandSpec::new("ytt");
    if step.paths.is_empty() {
        command = command.args(["-f", "-"]).stdin(input);
    } else {
        for path in &step.paths {
            let resolved = ctx.staging.resolve(path)?;
            command = command.arg("-f").arg(resolved.display().to_string());
        }
    }
    if ctx.staging.has_values() {
        command = command
            .arg("--data-values-file")
            .arg(ctx.staging.values_file().display().to_string());
    }
    command = command.args(step.raw_options.iter().cloned());
    Ok(ctx.runner.run(command).await?.stdout)
}

async fn run_kbld(ctx: &StageContext<'_>, step: &KbldStep, input: Vec<u8>) -> Result<Vec<u8>> {
    let command = CommandSpec::new("kbld")
        .args(["-f", "-"])
        .args(step.raw_options.iter().cloned())
        .stdin(input);
    Ok(ctx.runner.run(command).await?.stdout)
}

async fn run_helm_template(ctx: &StageContext<'_>, step: &HelmTemplateStep) -> Result<Vec<u8>> {
    let chart = match &step.path {
        Some(path) => ctx.staging.resolve(path)?,
        None => locate_chart(&ctx.staging.fetch_root().join("0"))?,
    };
    let release = step.name.as_deref().unwrap_or(&ctx.spec.app_name);
    let namespace = step.namespace.as_deref().unwrap_or(&ctx.spec.namespace);

    let mut command = CommandSpec::new("helm")
        .args(["template", release])
        .arg(chart.display().to_string())
        .args(["--namespace", namespace]);
    if ctx.staging.has_values() {
        command = command
            .arg("--values")
            .arg(ctx.staging.values_file().display().to_string());
    }
    Ok(ctx.runner.run(command).await?.stdout)
}

/// The chart directory inside a fetch directory: the directory itself if it
/// holds a `Chart.yaml`, otherwise its single subdirectory that does.
fn locate_chart(dir: &Path) -> Result<PathBuf> {
    if dir.join("Chart.yaml").is_file() {
        return Ok(dir.to_path_buf());
    }
    let mut charts = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.join("Chart.yaml").is_file() {
                charts.push(path);
            }
        }
    }
    match charts.len() {
        1 => Ok(charts.remove(0)),
        0 => Err(PipelineError::InvalidInput(format!(
            "no chart found under {}",
            dir.display()
        ))),
        n => Err(PipelineError::InvalidInput(format!(
            "{n} charts found under {}; set helmTemplate.path",
            dir.display()
        ))),
    }
}
