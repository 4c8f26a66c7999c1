//! End-to-end executor runs against scripted tools and an in-memory store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carton_core::*;
use carton_pipeline::fakes::{ScriptedRunner, StaticArtifacts};
use carton_pipeline::*;
use resource_store::{MemoryResourceStore, ObjectKey, ResourceStore, RetryPolicy, Selector};
use serde_json::json;

fn config_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    dir
}

fn local(dir: &Path) -> FetchSource {
    FetchSource::LocalDirectory(LocalDirectorySource {
        path: dir.display().to_string(),
    })
}

fn kapp() -> DeployStep {
    DeployStep::Kapp(KappDeployStep::default())
}

fn spec(fetch: Vec<FetchSource>, template: Vec<TemplateStep>) -> PipelineSpec {
    PipelineSpec::new("demo", "default", "installer", fetch, template, kapp()).unwrap()
}

fn executor(runner: Arc<dyn CommandRunner>, store: Arc<MemoryResourceStore>) -> PipelineExecutor {
    executor_with(runner, Arc::new(StaticArtifacts::new()), store, ExecutorConfig::default())
}

fn executor_with(
    runner: Arc<dyn CommandRunner>,
    artifacts: Arc<dyn ArtifactFetcher>,
    store: Arc<MemoryResourceStore>,
    mut config: ExecutorConfig,
) -> PipelineExecutor {
    config.store_retry = RetryPolicy::immediate(3);
    PipelineExecutor::new(runner, artifacts, store, config)
}

#[tokio::test]
async fn test_identical_inputs_produce_identical_manifests() {
    let dir = config_dir(&[
        ("b.yml", "kind: ConfigMap\nmetadata:\n  name: b\n"),
        ("a.yaml", "kind: ConfigMap\nmetadata:\n  name: a\n"),
        ("README.md", "ignored"),
    ]);
    let runner = Arc::new(ScriptedRunner::new());
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor(runner.clone(), store);
    let spec = spec(
        vec![local(dir.path())],
        vec![TemplateStep::Ytt(YttStep::default()), TemplateStep::Kbld(KbldStep::default())],
    );

    let first = exec.run(&spec, &CancelToken::never()).await.unwrap();
    let second = exec.run(&spec, &CancelToken::never()).await.unwrap();

    assert_eq!(first.manifest, second.manifest);
    assert_eq!(first.deploy.manifest_digest, second.deploy.manifest_digest);
    let text = String::from_utf8(first.manifest.clone()).unwrap();
    assert!(text.find("name: a").unwrap() < text.find("name: b").unwrap());
    assert!(!text.contains("ignored"));
    assert_eq!(first.stages.len(), 4);
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "deploy"]);
}

#[tokio::test]
async fn test_stage_failure_names_stage_and_keeps_partial_output() {
    let dir = config_dir(&[("app.yml", "kind: Service\n")]);
    let runner = Arc::new(ScriptedRunner::new().always_fail("kbld", "image not found"));
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor(runner.clone(), store);
    let spec = spec(
        vec![local(dir.path())],
        vec![TemplateStep::Ytt(YttStep::default()), TemplateStep::Kbld(KbldStep::default())],
    );

    let err = exec.run(&spec, &CancelToken::never()).await.unwrap_err();
    let RunError::Stage {
        failure,
        completed,
        staging,
    } = err
    else {
        panic!("expected a stage failure");
    };
    assert_eq!(failure.stage_kind, StageKind::Template);
    assert_eq!(failure.index, 1);
    assert_eq!(failure.driver, "kbld");
    assert!(failure.message.contains("image not found"));
    assert_eq!(completed.len(), 2);

    let staging = staging.unwrap();
    assert!(staging.template_output(0).is_file());
    assert!(!staging.deploy_file().exists());
    assert_eq!(runner.calls_to("kapp"), 0);
}

/// Cancels the run while the first command is executing.
struct CancellingRunner {
    inner: ScriptedRunner,
    handle: CancelHandle,
}

#[async_trait]
impl CommandRunner for CancellingRunner {
    async fn run(&self, command: CommandSpec) -> std::result::Result<CommandOutput, PipelineError> {
        self.handle.cancel();
        self.inner.run(command).await
    }
}

#[tokio::test]
async fn test_cancellation_is_observed_at_next_stage_boundary() {
    let dir = config_dir(&[("app.yml", "kind: Service\n")]);
    let (handle, token) = cancel_pair();
    let runner = Arc::new(CancellingRunner {
        inner: ScriptedRunner::new(),
        handle,
    });
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor(runner.clone(), store);
    let spec = spec(
        vec![local(dir.path())],
        vec![TemplateStep::Ytt(YttStep::default()), TemplateStep::Kbld(KbldStep::default())],
    );

    match exec.run(&spec, &token).await {
        Err(RunError::Cancelled { completed }) => {
            // fetch and the in-flight ytt stage finished; kbld never started
            assert_eq!(completed.len(), 2);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(runner.inner.calls_to("kbld"), 0);
    assert_eq!(runner.inner.calls_to("kapp"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_becomes_stage_failure() {
    let dir = config_dir(&[("app.yml", "kind: Service\n")]);
    let runner = Arc::new(ScriptedRunner::new().with_delay("kapp", Duration::from_secs(120)));
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor_with(
        runner,
        Arc::new(StaticArtifacts::new()),
        store,
        ExecutorConfig {
            run_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let spec = spec(vec![local(dir.path())], vec![]);

    let err = exec.run(&spec, &CancelToken::never()).await.unwrap_err();
    let failure = err.stage_failure().unwrap();
    assert!(failure.timed_out);
    assert_eq!(failure.stage_kind, StageKind::Deploy);
}

#[tokio::test]
async fn test_placeholder_secret_created_then_removed_on_cleanup() {
    let runner = Arc::new(
        ScriptedRunner::new().with_file("imgpkg", "config/app.yml", b"kind: Deployment\n"),
    );
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor(runner.clone(), store.clone());
    let spec = spec(
        vec![FetchSource::ImgpkgBundle(ImgpkgBundleSource {
            image: "registry.example.com/demo:1.0.0".into(),
            secret_ref: None,
        })],
        vec![],
    );

    let report = exec.run(&spec, &CancelToken::never()).await.unwrap();
    assert_eq!(report.manifest, b"---\nkind: Deployment\n");

    let placeholder = ObjectKey::new(SECRET_KIND, "default", placeholder_secret_name("demo", 0));
    let secret = store.get(&placeholder).await.unwrap();
    assert_eq!(secret.metadata.labels.get(PLACEHOLDER_LABEL).map(String::as_str), Some("demo"));

    // a second run reuses the existing placeholder
    exec.run(&spec, &CancelToken::never()).await.unwrap();

    exec.cleanup(&spec).await.unwrap();
    assert!(store.get(&placeholder).await.unwrap_err().is_not_found());
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "deploy", "delete"]);
}

#[tokio::test]
async fn test_cleanup_removes_placeholder_even_when_delete_fails() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_file("imgpkg", "config/app.yml", b"kind: Deployment\n")
            .always_fail("kapp", "cluster unreachable"),
    );
    let store = Arc::new(MemoryResourceStore::new());
    let exec = executor(runner.clone(), store.clone());
    let spec = spec(
        vec![FetchSource::ImgpkgBundle(ImgpkgBundleSource {
            image: "registry.example.com/demo:1.0.0".into(),
            secret_ref: None,
        })],
        vec![],
    );

    // the deploy fails too, but only after fetch created the placeholder
    assert!(exec.run(&spec, &CancelToken::never()).await.is_err());
    let placeholder = ObjectKey::new(SECRET_KIND, "default", placeholder_secret_name("demo", 0));
    store.get(&placeholder).await.unwrap();

    let failure = exec.cleanup(&spec).await.unwrap_err();
    assert_eq!(failure.stage_kind, StageKind::Deploy);
    assert!(failure.message.contains("cluster unreachable"));
    assert!(store.get(&placeholder).await.unwrap_err().is_not_found());
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "delete"]);
}

#[tokio::test]
async fn test_values_file_written_and_passed_to_ytt() {
    let dir = config_dir(&[("app.yml", "kind: Service\n")]);
    let runner = Arc::new(ScriptedRunner::new());
    let store = Arc::new(MemoryResourceStore::new());
    let secret = Object::new(
        "default",
        "demo-values",
        SecretSpec {
            secret_type: None,
            data: [("values.yml".to_string(), "replicas: 3\n".to_string())].into(),
        },
    );
    create_object(store.as_ref(), &secret).await.unwrap();

    let exec = executor(runner.clone(), store);
    let spec = spec(
        vec![local(dir.path())],
        vec![
            TemplateStep::Values(ValuesStep {
                sources: vec![
                    ValueSource::Inline(json!({"replicas": 1, "name": "demo"})),
                    ValueSource::SecretRef(DataRef {
                        name: "demo-values".into(),
                        key: None,
                    }),
                ],
            }),
            TemplateStep::Ytt(YttStep::default()),
        ],
    );

    let report = exec.run(&spec, &CancelToken::never()).await.unwrap();
    let values: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(report.staging.values_file()).unwrap()).unwrap();
    assert_eq!(values["replicas"].as_u64(), Some(3));
    assert_eq!(values["name"].as_str(), Some("demo"));

    let ytt = runner.calls().into_iter().find(|c| c.program == "ytt").unwrap();
    assert!(ytt.args.contains(&"--data-values-file".to_string()));
}

#[tokio::test]
async fn test_release_assets_downloaded_with_token() {
    let url = "https://github.com/acme/demo/releases/download/v1.0.0/release.yml";
    let artifacts = Arc::new(StaticArtifacts::new().with(url, b"kind: Namespace\n"));
    let runner = Arc::new(ScriptedRunner::new());
    let store = Arc::new(MemoryResourceStore::new());
    let token = Object::new(
        "default",
        "gh-token",
        SecretSpec {
            secret_type: None,
            data: [("token".to_string(), "s3cret".to_string())].into(),
        },
    );
    create_object(store.as_ref(), &token).await.unwrap();

    let exec = executor_with(runner, artifacts.clone(), store.clone(), ExecutorConfig::default());
    let spec = spec(
        vec![FetchSource::GithubRelease(GithubReleaseSource {
            slug: "acme/demo".into(),
            tag: "v1.0.0".into(),
            assets: vec!["release.yml".into()],
            base_url: None,
            secret_ref: Some(LocalRef {
                name: "gh-token".into(),
            }),
        })],
        vec![],
    );

    let report = exec.run(&spec, &CancelToken::never()).await.unwrap();
    assert_eq!(report.manifest, b"---\nkind: Namespace\n");
    assert_eq!(
        artifacts.requests(),
        vec![(url.to_string(), Some("s3cret".to_string()))]
    );
    let placeholders = store
        .list(SECRET_KIND, Some("default"), &Selector::everything().with_label(PLACEHOLDER_LABEL, "demo"))
        .await
        .unwrap();
    assert!(placeholders.is_empty());
}
