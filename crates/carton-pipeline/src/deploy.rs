//! Deploy driver and cleanup.

use carton_core::{digest_bytes, DeployStep, KappDeployStep, PipelineSpec, ResourceSpec, SecretSpec};
use resource_store::{retry_transient, ResourceStore, RetryPolicy, Selector};
use tracing::info;

use crate::error::Result;
use crate::fetch::PLACEHOLDER_LABEL;
use crate::runner::{CommandRunner, CommandSpec};
use crate::stage::StageContext;
use crate::staging::write_file;

/// Environment variable carrying the service account the applier acts as.
pub const SERVICE_ACCOUNT_ENV: &str = "CARTON_SERVICE_ACCOUNT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutput {
    /// SHA-256 of the applied manifest stream.
    pub manifest_digest: String,
    pub applier_output: String,
}

/// Apply the final manifest stream.
pub async fn run_deploy(ctx: &StageContext<'_>, manifest: &[u8]) -> Result<DeployOutput> {
    let file = ctx.staging.deploy_file();
    write_file(&file, manifest)?;

    let command = match &ctx.spec.deploy {
        DeployStep::Kapp(kapp) => kapp_command(ctx.spec, kapp, "deploy")
            .args(["--file".to_string(), file.display().to_string()])
            .arg("--yes")
            .args(kapp.raw_options.iter().cloned()),
    };
    let output = ctx.runner.run(command).await?;
    Ok(DeployOutput {
        manifest_digest: digest_bytes(manifest),
        applier_output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
    })
}

/// Remove everything the deploy stage applied for this application.
pub async fn run_delete(runner: &dyn CommandRunner, spec: &PipelineSpec) -> Result<()> {
    let command = match &spec.deploy {
        DeployStep::Kapp(kapp) => kapp_command(spec, kapp, "delete")
            .arg("--yes")
            .args(kapp.delete_options.iter().cloned()),
    };
    runner.run(command).await?;
    info!(app = %spec.app_name, namespace = %spec.namespace, "deleted application resources");
    Ok(())
}

fn kapp_command(spec: &PipelineSpec, kapp: &KappDeployStep, verb: &str) -> CommandSpec {
    let account = kapp
        .service_account_name
        .as_deref()
        .unwrap_or(&spec.service_account_name);
    CommandSpec::new("kapp")
        .args([verb, "--app", spec.app_name.as_str(), "--namespace", spec.namespace.as_str()])
        .env(SERVICE_ACCOUNT_ENV, account)
}

/// Delete every placeholder credential generated for `app_name`.
pub async fn delete_placeholder_secrets(
    store: &dyn ResourceStore,
    namespace: &str,
    app_name: &str,
    retry: &RetryPolicy,
) -> Result<usize> {
    let selector = Selector::everything().with_label(PLACEHOLDER_LABEL, app_name);
    let secrets = retry_transient(retry, "list-placeholders", || {
        store.list(SecretSpec::KIND, Some(namespace), &selector)
    })
    .await?;

    let mut deleted = 0;
    for secret in secrets {
        let key = secret.key();
        match retry_transient(retry, "delete-placeholder", || store.delete(&key)).await {
            Ok(()) => deleted += 1,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    if deleted > 0 {
        info!(app = %app_name, deleted, "deleted placeholder credentials");
    }
    Ok(deleted)
}
