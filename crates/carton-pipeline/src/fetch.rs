//! Fetch drivers.
//!
//! Each declared source is retrieved into its own `fetch/<i>` directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use carton_core::{
    FetchSource, GithubReleaseSource, HelmChartSource, ImgpkgBundleSource, LocalDirectorySource,
    LocalRef, Object, ResourceSpec, SecretSpec,
};
use resource_store::{retry_transient, ObjectKey, StorageError, StoredObject};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::http::release_asset_url;
use crate::runner::CommandSpec;
use crate::stage::StageContext;
use crate::staging::copy_tree;

/// Label carried by generated placeholder credentials; the value is the
/// owning application name.
pub const PLACEHOLDER_LABEL: &str = "carton.dev/placeholder-for";

pub fn placeholder_secret_name(app_name: &str, index: usize) -> String {
    format!("{app_name}-fetch{index}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutput {
    pub dir: PathBuf,
    pub files: usize,
}

/// Run the driver for fetch source `index`.
pub async fn run_fetch(ctx: &StageContext<'_>, index: usize, source: &FetchSource) -> Result<FetchOutput> {
    let dir = ctx.staging.fetch_dir(index)?;
    match source {
        FetchSource::ImgpkgBundle(bundle) => fetch_bundle(ctx, index, bundle, &dir).await?,
        FetchSource::GithubRelease(release) => fetch_release(ctx, index, release, &dir).await?,
        FetchSource::HelmChart(chart) => fetch_chart(ctx, chart, &dir).await?,
        FetchSource::LocalDirectory(local) => fetch_local(local, &dir)?,
    }
    let files = count_files(&dir)?;
    debug!(index, driver = source.driver_name(), files, "fetched");
    Ok(FetchOutput { dir, files })
}

async fn fetch_bundle(
    ctx: &StageContext<'_>,
    index: usize,
    bundle: &ImgpkgBundleSource,
    dir: &Path,
) -> Result<()> {
    let creds = credentials(ctx, index, bundle.secret_ref.as_ref()).await?;
    let mut command = CommandSpec::new("imgpkg")
        .args(["pull", "-b", bundle.image.as_str(), "-o"])
        .arg(dir.display().to_string())
        .output_dir(dir);
    if let (Some(user), Some(password)) = (creds.get("username"), creds.get("password")) {
        command = command
            .env("IMGPKG_USERNAME", user)
            .env("IMGPKG_PASSWORD", password);
    }
    ctx.runner.run(command).await?;
    Ok(())
}

async fn fetch_release(
    ctx: &StageContext<'_>,
    index: usize,
    release: &GithubReleaseSource,
    dir: &Path,
) -> Result<()> {
    if release.assets.is_empty() {
        return Err(PipelineError::InvalidInput(format!(
            "release {}@{} lists no assets",
            release.slug, release.tag
        )));
    }
    let creds = credentials(ctx, index, release.secret_ref.as_ref()).await?;
    let token = creds.get("token").map(String::as_str);
    for asset in &release.assets {
        if asset.contains('/') || asset.contains("..") {
            return Err(PipelineError::InvalidInput(format!(
                "asset name '{asset}' must be a plain file name"
            )));
        }
        let url = release_asset_url(release.base_url.as_deref(), &release.slug, &release.tag, asset);
        let bytes = ctx.artifacts.download(&url, token).await?;
        std::fs::write(dir.join(asset), bytes)?;
    }
    Ok(())
}

async fn fetch_chart(ctx: &StageContext<'_>, chart: &HelmChartSource, dir: &Path) -> Result<()> {
    let mut command = CommandSpec::new("helm")
        .args(["pull", chart.name.as_str(), "--untar", "--untardir"])
        .arg(dir.display().to_string())
        .output_dir(dir);
    if let Some(version) = &chart.version {
        command = command.args(["--version", version.as_str()]);
    }
    if let Some(repo) = &chart.repository_url {
        command = command.args(["--repo", repo.as_str()]);
    }
    ctx.runner.run(command).await?;
    Ok(())
}

fn fetch_local(local: &LocalDirectorySource, dir: &Path) -> Result<()> {
    let from = Path::new(&local.path);
    if !from.is_dir() {
        return Err(PipelineError::InvalidInput(format!(
            "local directory '{}' does not exist",
            local.path
        )));
    }
    copy_tree(from, dir)?;
    Ok(())
}

/// Credentials for a registry-backed fetch: the referenced Secret's data,
/// or an empty placeholder Secret generated for this source.
async fn credentials(
    ctx: &StageContext<'_>,
    index: usize,
    secret_ref: Option<&LocalRef>,
) -> Result<BTreeMap<String, String>> {
    let name = match secret_ref {
        Some(r) => r.name.clone(),
        None => {
            ensure_placeholder_secret(ctx, index).await?;
            return Ok(BTreeMap::new());
        }
    };
    let key = ObjectKey::new(SecretSpec::KIND, &ctx.spec.namespace, &name);
    let object = retry_transient(ctx.retry, "get-secret", || ctx.store.get(&key)).await?;
    Ok(Object::<SecretSpec>::from_stored(object)?.spec.data)
}

async fn ensure_placeholder_secret(ctx: &StageContext<'_>, index: usize) -> Result<()> {
    let name = placeholder_secret_name(&ctx.spec.app_name, index);
    let mut secret = StoredObject::new(
        SecretSpec::KIND,
        &ctx.spec.namespace,
        &name,
        serde_json::to_value(SecretSpec {
            secret_type: Some("carton.dev/placeholder".to_string()),
            data: BTreeMap::new(),
        })
        .map_err(carton_core::CartonError::from)?,
    );
    secret
        .metadata
        .labels
        .insert(PLACEHOLDER_LABEL.to_string(), ctx.spec.app_name.clone());

    match retry_transient(ctx.retry, "create-placeholder", || ctx.store.create(secret.clone())).await {
        Ok(_) => {
            info!(secret = %name, "created placeholder credential");
            Ok(())
        }
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn count_files(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}
