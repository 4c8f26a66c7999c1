//! Carton - declarative package installs
//!
//! The `carton` command drives the local simulation harness and inspects
//! package documents without a cluster.
//!
//! ## Commands
//!
//! - `dev deploy`: reconcile InstallRequests and Apps from local files
//! - `package available get|list`: published packages and versions
//! - `package resolve`: pick the version a reference selects
//! - `package installed get`: status of an install, or its values

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use carton_controller::{LocalHarness, LocalOptions, LocalReport};
use carton_core::{
    export_documents, get_object, list_objects, load_value_documents, package_version_name,
    ControllerConfig, Documents, InstallRequestSpec, PackageMetadataSpec, PackageRef,
    PackageVersionSpec, VersionResolver, DEFAULT_NAMESPACE, METRICS,
};
use carton_pipeline::{
    ArtifactFetcher, CommandRunner, HttpArtifactFetcher, ProcessRunner, StagingMode,
};
use clap::{Args, Parser, Subcommand};
use resource_store::{MemoryResourceStore, ResourceStore, RetryPolicy, Selector};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "carton")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Declarative package installs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local development workflows
    Dev {
        #[command(subcommand)]
        action: DevAction,
    },

    /// Inspect published and installed packages
    Package {
        #[command(subcommand)]
        action: PackageAction,
    },
}

#[derive(Args)]
struct Inputs {
    /// Document files (multi-document YAML)
    #[arg(short = 'f', long = "file", required = true)]
    files: Vec<PathBuf>,

    /// Namespace for documents that do not name one
    #[arg(short, long, env = "CARTON_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,
}

#[derive(Subcommand)]
enum DevAction {
    /// Reconcile every InstallRequest and App in the given files
    Deploy {
        #[command(flatten)]
        inputs: Inputs,

        /// Run only the cleanup path
        #[arg(long, conflicts_with = "watch")]
        delete: bool,

        /// Use local fetch source
        #[arg(short, long)]
        local: bool,

        /// Log every stage and store write
        #[arg(long)]
        debug: bool,

        /// Keep reconciling (resync and retries) until interrupted
        #[arg(long)]
        watch: bool,

        /// Stage pipeline files in this directory and keep them
        #[arg(long)]
        keep_staging: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PackageAction {
    /// Packages published in the given files
    Available {
        #[command(subcommand)]
        action: AvailableAction,
    },

    /// Print the version a reference selects
    Resolve {
        #[command(flatten)]
        inputs: Inputs,

        /// Package reference: name or name/constraint
        #[arg(short, long)]
        package: String,
    },

    /// Installed packages
    Installed {
        #[command(subcommand)]
        action: InstalledAction,
    },
}

#[derive(Subcommand)]
enum AvailableAction {
    /// Package metadata, plus release details when a version is given
    Get {
        #[command(flatten)]
        inputs: Inputs,

        /// name or name/version
        #[arg(short, long)]
        package: String,
    },

    /// Published versions, oldest first
    List {
        #[command(flatten)]
        inputs: Inputs,

        /// Only versions of this package
        #[arg(short, long)]
        package: Option<String>,
    },
}

#[derive(Subcommand)]
enum InstalledAction {
    /// Status summary of an InstallRequest
    Get {
        #[command(flatten)]
        inputs: Inputs,

        /// InstallRequest name
        #[arg(long)]
        name: String,

        /// Write the merged value documents here instead
        #[arg(long)]
        values_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = matches!(
        cli.command,
        Commands::Dev {
            action: DevAction::Deploy { debug: true, .. }
        }
    );
    let level = if cli.verbose || debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    carton_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Dev { action } => match action {
            DevAction::Deploy {
                inputs,
                delete,
                local,
                watch,
                keep_staging,
                ..
            } => {
                let code = cmd_dev_deploy(&inputs, delete, local, watch, keep_staging).await?;
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
        },
        Commands::Package { action } => {
            let output = match action {
                PackageAction::Available { action } => match action {
                    AvailableAction::Get { inputs, package } => {
                        let store = load_store(&inputs).await?;
                        render_available(store.as_ref(), &inputs.namespace, &package).await?
                    }
                    AvailableAction::List { inputs, package } => {
                        let store = load_store(&inputs).await?;
                        render_versions(store.as_ref(), &inputs.namespace, package.as_deref()).await?
                    }
                },
                PackageAction::Resolve { inputs, package } => {
                    let store = load_store(&inputs).await?;
                    render_resolved(store, &inputs.namespace, &package).await?
                }
                PackageAction::Installed {
                    action:
                        InstalledAction::Get {
                            inputs,
                            name,
                            values_file,
                        },
                } => {
                    let store = load_store(&inputs).await?;
                    match values_file {
                        Some(path) => {
                            export_values(store.as_ref(), &inputs.namespace, &name, &path).await?
                        }
                        None => render_installed(store.as_ref(), &inputs.namespace, &name).await?,
                    }
                }
            };
            print!("{output}");
            Ok(())
        }
    }
}

async fn load_store(inputs: &Inputs) -> Result<Arc<MemoryResourceStore>> {
    let documents = Documents::from_files(&inputs.files, &inputs.namespace)
        .context("Failed to load documents")?;
    let store = Arc::new(MemoryResourceStore::new());
    documents
        .load_into(store.as_ref(), &RetryPolicy::default())
        .await
        .context("Failed to load documents into the store")?;
    Ok(store)
}

/// Run the local simulation harness with the real tools on `PATH`.
async fn cmd_dev_deploy(
    inputs: &Inputs,
    delete: bool,
    local_fetch: bool,
    watch: bool,
    keep_staging: Option<PathBuf>,
) -> Result<i32> {
    let documents = Documents::from_files(&inputs.files, &inputs.namespace)
        .context("Failed to load documents")?;
    let options = LocalOptions {
        delete,
        local_fetch,
        staging: keep_staging.map_or(StagingMode::Temporary, StagingMode::Persistent),
        config: ControllerConfig::from_env(),
    };
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ProcessRunner::new().with_timeout(options.config.run_timeout));
    let artifacts: Arc<dyn ArtifactFetcher> =
        Arc::new(HttpArtifactFetcher::new().context("Failed to build HTTP client")?);

    deploy_with(&documents, runner, artifacts, options, watch).await
}

async fn deploy_with(
    documents: &Documents,
    runner: Arc<dyn CommandRunner>,
    artifacts: Arc<dyn ArtifactFetcher>,
    options: LocalOptions,
    watch: bool,
) -> Result<i32> {
    let harness = LocalHarness::new(documents, runner, artifacts, options)
        .await
        .context("Failed to start local harness")?;
    let sink = |line: &str| println!("{line}");

    let report = if watch {
        info!("watching; interrupt to stop");
        let interrupted = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for interrupts; stopping");
            }
        };
        harness.watch(interrupted, sink).await?
    } else {
        harness.run(sink).await?
    };

    print!("{}", render_report(&report));
    METRICS.flush();
    Ok(report.exit_code())
}

fn render_report(report: &LocalReport) -> String {
    let mut out = String::from("\n");
    for record in &report.records {
        let _ = write!(out, "{}: {}", record.key, record.phase);
        if !record.message.is_empty() {
            let _ = write!(out, " ({})", record.message);
        }
        out.push('\n');
    }
    out
}

async fn render_available(store: &dyn ResourceStore, namespace: &str, reference: &str) -> Result<String> {
    let (name, version) = match reference.split_once('/') {
        Some((name, version)) => (name, Some(version)),
        None => (reference, None),
    };
    let metadata = get_object::<PackageMetadataSpec>(store, namespace, name)
        .await
        .with_context(|| format!("Package '{name}' not found in namespace '{namespace}'"))?;
    let spec = &metadata.spec;

    let mut out = String::new();
    writeln!(out, "Name:                 {name}")?;
    writeln!(out, "Display name:         {}", spec.display_name)?;
    writeln!(out, "Short description:    {}", spec.short_description)?;
    writeln!(out, "Provider:             {}", spec.provider_name)?;
    let maintainers: Vec<&str> = spec.maintainers.iter().map(|m| m.name.as_str()).collect();
    writeln!(out, "Maintainers:          {}", maintainers.join(", "))?;
    writeln!(out, "Categories:           {}", spec.categories.join(", "))?;
    writeln!(out, "Support:              {}", spec.support_description)?;
    if !spec.long_description.is_empty() {
        writeln!(out, "\n{}", spec.long_description.trim_end())?;
    }

    if let Some(version) = version {
        let release = get_object::<PackageVersionSpec>(store, namespace, &package_version_name(name, version))
            .await
            .with_context(|| format!("Version '{version}' of '{name}' not found"))?;
        let spec = &release.spec;
        let released = spec
            .released_at
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        writeln!(out)?;
        writeln!(out, "Version:              {}", spec.version)?;
        writeln!(out, "Released at:          {released}")?;
        writeln!(out, "Licenses:             {}", spec.licenses.join(", "))?;
        writeln!(out, "Capacity:             {}", spec.capacity_requirements_description)?;
        if !spec.release_notes.is_empty() {
            writeln!(out, "Release notes:\n{}", spec.release_notes.trim_end())?;
        }
    }
    Ok(out)
}

async fn render_versions(store: &dyn ResourceStore, namespace: &str, package: Option<&str>) -> Result<String> {
    let mut versions = list_objects::<PackageVersionSpec>(store, Some(namespace), &Selector::everything())
        .await
        .context("Failed to list package versions")?;
    versions.retain(|v| package.map_or(true, |p| v.spec.ref_name == p));
    versions.sort_by(|a, b| {
        let order = |v: &PackageVersionSpec| (v.ref_name.clone(), semver::Version::parse(&v.version).ok());
        order(&a.spec).cmp(&order(&b.spec))
    });

    let mut out = format!("{:<32} {:<16} {}\n", "NAME", "VERSION", "RELEASED-AT");
    for version in &versions {
        let released = version
            .spec
            .released_at
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        writeln!(out, "{:<32} {:<16} {released}", version.spec.ref_name, version.spec.version)?;
    }
    Ok(out)
}

async fn render_resolved(store: Arc<MemoryResourceStore>, namespace: &str, reference: &str) -> Result<String> {
    let package = PackageRef::parse(reference)?;
    let resolver = VersionResolver::new(store);
    let version = resolver
        .resolve(namespace, &package)
        .await
        .with_context(|| format!("Cannot resolve '{reference}'"))?;
    Ok(format!("{}\n", version.spec.version))
}

async fn render_installed(store: &dyn ResourceStore, namespace: &str, name: &str) -> Result<String> {
    let install = get_object::<InstallRequestSpec>(store, namespace, name)
        .await
        .with_context(|| format!("InstallRequest '{name}' not found in namespace '{namespace}'"))?;
    let status = &install.status;
    let package = &install.spec.package_ref;

    let mut out = String::new();
    writeln!(out, "Name:                 {name}")?;
    writeln!(out, "Package:              {}", package.ref_name)?;
    writeln!(out, "Constraint:           {}", package.constraint().unwrap_or("-"))?;
    writeln!(out, "Resolved version:     {}", status.resolved_version.as_deref().unwrap_or("-"))?;
    writeln!(out, "Paused:               {}", install.spec.paused)?;
    let description = if status.friendly_description.is_empty() {
        "-"
    } else {
        status.friendly_description.as_str()
    };
    writeln!(out, "Status:               {description}")?;
    for condition in &status.conditions {
        writeln!(out, "  {}={} {}", condition.condition_type, condition.status, condition.reason)?;
    }
    if !status.useful_error_message.is_empty() {
        writeln!(out, "Useful error message: {}", status.useful_error_message)?;
    }
    Ok(out)
}

/// Write the value documents of an install to `path`.
async fn export_values(store: &dyn ResourceStore, namespace: &str, name: &str, path: &Path) -> Result<String> {
    let install = get_object::<InstallRequestSpec>(store, namespace, name)
        .await
        .with_context(|| format!("InstallRequest '{name}' not found in namespace '{namespace}'"))?;
    let documents = load_value_documents(store, namespace, &install.spec.values, &RetryPolicy::default())
        .await
        .context("Failed to read value sources")?;
    std::fs::write(path, export_documents(&documents))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(format!("Wrote {} value documents to {}\n", documents.len(), path.display()))
}
