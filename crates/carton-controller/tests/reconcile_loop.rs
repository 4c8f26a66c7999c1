//! Reconcile passes, the watch-driven controller and the local harness,
//! against scripted tools and an in-memory store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carton_controller::*;
use carton_core::*;
use carton_pipeline::fakes::{ScriptedRunner, StaticArtifacts};
use carton_pipeline::{CancelToken, ExecutorConfig, PipelineExecutor};
use resource_store::{
    MemoryResourceStore, ObjectKey, ResourceStore, RetryPolicy, Selector, StorageError,
    StorageResult, StoredObject, WatchStream,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

const BUNDLE_APP: &str = r#"
kind: App
metadata:
  name: demo
spec:
  serviceAccountName: installer
  syncPeriod: "0"
  fetch:
    - imgpkgBundle:
        image: registry.example.com/demo:1.0.0
  template:
    - ytt: {}
  deploy:
    - kapp: {}
"#;

fn package_versions() -> String {
    ["1.0.0", "1.2.0", "2.0.0"]
        .iter()
        .map(|v| {
            format!(
                r#"
kind: PackageVersion
metadata:
  name: demo.{v}
spec:
  refName: demo
  version: "{v}"
  template:
    fetch:
      - imgpkgBundle:
          image: registry.example.com/demo:{v}
    template:
      - ytt: {{}}
    deploy:
      - kapp: {{}}
---
"#
            )
        })
        .collect()
}

fn install(constraint: &str) -> String {
    format!(
        r#"
kind: InstallRequest
metadata:
  name: demo
spec:
  serviceAccountName: installer
  syncPeriod: "0"
  packageRef:
    refName: demo
    versionSelection:
      constraints: "{constraint}"
"#
    )
}

fn config() -> ControllerConfig {
    ControllerConfig {
        backoff_base: Duration::from_secs(3600),
        backoff_max: Duration::from_secs(7200),
        store_retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

fn scripted() -> ScriptedRunner {
    ScriptedRunner::new().with_file("imgpkg", "config/app.yml", b"kind: Deployment\n")
}

async fn harness(yaml: &str, runner: Arc<ScriptedRunner>, options: LocalOptions) -> LocalHarness {
    let documents = Documents::parse(yaml, DEFAULT_NAMESPACE).unwrap();
    LocalHarness::new(&documents, runner, Arc::new(StaticArtifacts::new()), options)
        .await
        .unwrap()
}

fn options() -> LocalOptions {
    LocalOptions {
        config: config(),
        ..Default::default()
    }
}

fn key(kind: &str) -> ObjectKey {
    ObjectKey::new(kind, DEFAULT_NAMESPACE, "demo")
}

async fn status(store: &MemoryResourceStore, key: &ObjectKey) -> ReconcileStatus {
    record_status(&store.get(key).await.unwrap())
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_local_install_resolves_and_succeeds() {
    let runner = Arc::new(scripted());
    let yaml = format!("{}{}", package_versions(), install("1.x"));
    let harness = harness(&yaml, runner.clone(), options()).await;

    let report = harness.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(report
        .transitions
        .iter()
        .any(|line| line.contains("InstallRequest/demo: ReconcileSucceeded=True")));

    let stored = harness.store().get(&key(INSTALL_REQUEST_KIND)).await.unwrap();
    assert!(stored.has_finalizer(CLEANUP_FINALIZER));
    let status = record_status(&stored);
    assert_eq!(status.phase(), Phase::Succeeded);
    assert_eq!(status.resolved_version.as_deref(), Some("1.2.0"));
    assert_eq!(status.observed_generation, stored.metadata.generation);

    let pulls = runner.calls().into_iter().filter(|c| c.program == "imgpkg").collect::<Vec<_>>();
    assert_eq!(pulls.len(), 1);
    assert!(pulls[0].args.contains(&"registry.example.com/demo:1.2.0".to_string()));
    assert_eq!(runner.verbs("kapp"), vec!["deploy"]);
}

#[tokio::test]
async fn test_transient_fetch_failure_then_success() {
    let runner = Arc::new(scripted().fail_times("imgpkg", 1, "dial tcp: i/o timeout"));
    let harness = harness(BUNDLE_APP, runner.clone(), options()).await;
    let reconciler = harness.reconciler();
    let app = key(APP_KIND);

    let first = reconciler
        .reconcile(&app, Trigger::Explicit, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(first, Outcome::Failed { retry_in: Duration::from_secs(3600) });

    let failed = status(harness.store(), &app).await;
    assert_eq!(failed.phase(), Phase::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.next_retry_at.is_some());
    let condition = failed.condition(ConditionType::ReconcileFailed).unwrap();
    assert_eq!(condition.reason, "StageFailure");
    assert!(condition.message.contains("fetch stage 0 (imgpkgBundle)"));
    assert!(condition.message.contains("dial tcp: i/o timeout"));
    assert!(failed.condition(ConditionType::Reconciling).is_none());

    let second = reconciler
        .reconcile(&app, Trigger::Retry, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(second, Outcome::Succeeded { resync: None });

    let recovered = status(harness.store(), &app).await;
    assert_eq!(recovered.phase(), Phase::Succeeded);
    assert_eq!(recovered.retry_count, 0);
    assert!(recovered.condition(ConditionType::ReconcileFailed).is_none());

    let position = |wanted: ConditionType| {
        recovered
            .history
            .iter()
            .position(|c| c.condition_type == wanted && c.status == ConditionStatus::True)
            .unwrap()
    };
    assert!(position(ConditionType::ReconcileFailed) < position(ConditionType::ReconcileSucceeded));
}

#[tokio::test]
async fn test_unsatisfiable_constraint_reported_once() {
    let runner = Arc::new(scripted());
    let yaml = format!("{}{}", package_versions(), install(">=3.0.0"));
    let harness = harness(&yaml, runner.clone(), options()).await;
    let request = key(INSTALL_REQUEST_KIND);
    let reconciler = harness.reconciler();

    let outcome = reconciler
        .reconcile(&request, Trigger::Explicit, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Blocked);

    let stored = harness.store().get(&request).await.unwrap();
    let status = record_status(&stored);
    let condition = status.condition(ConditionType::ReconcileFailed).unwrap();
    assert_eq!(condition.reason, "NoMatchingVersion");
    assert_eq!(status.retry_count, 0);

    let again = reconciler
        .reconcile(&request, Trigger::Watch, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(again, Outcome::Blocked);
    let unchanged = harness.store().get(&request).await.unwrap();
    assert_eq!(unchanged.metadata.resource_version, stored.metadata.resource_version);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_unchanged_fingerprint_skips_watch_but_not_resync() {
    let runner = Arc::new(scripted());
    let harness = harness(BUNDLE_APP, runner.clone(), options()).await;
    let reconciler = harness.reconciler();
    let app = key(APP_KIND);
    let never = CancelToken::never();

    reconciler.reconcile(&app, Trigger::Explicit, &never).await.unwrap();
    let skipped = reconciler.reconcile(&app, Trigger::Watch, &never).await.unwrap();
    assert_eq!(skipped, Outcome::Skipped { resync: None });
    assert_eq!(runner.verbs("kapp"), vec!["deploy"]);

    let rerun = reconciler.reconcile(&app, Trigger::Resync, &never).await.unwrap();
    assert_eq!(rerun, Outcome::Succeeded { resync: None });
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "deploy"]);
}

#[tokio::test]
async fn test_paused_record_never_runs() {
    let runner = Arc::new(scripted());
    let yaml = BUNDLE_APP.replace("syncPeriod: \"0\"", "syncPeriod: \"0\"\n  paused: true");
    let harness = harness(&yaml, runner.clone(), options()).await;

    let report = harness.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 1);
    assert!(report.transitions.iter().any(|line| line == "App/demo: paused"));

    let status = status(harness.store(), &key(APP_KIND)).await;
    assert_eq!(status.friendly_description, "Paused");
    assert!(status.conditions.is_empty());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_local_failure_exit_code() {
    let runner = Arc::new(scripted().always_fail("kapp", "admission webhook denied the request"));
    let harness = harness(BUNDLE_APP, runner, options()).await;

    let report = harness.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.records[0].phase, Phase::Failed);
    assert!(report.records[0].message.contains("deploy stage 0 (kapp)"));
    assert!(report
        .transitions
        .iter()
        .any(|line| line.contains("ReconcileFailed=True (StageFailure)")));
}

#[tokio::test]
async fn test_local_delete_mode_runs_cleanup_only() {
    let runner = Arc::new(scripted());
    let harness = harness(
        BUNDLE_APP,
        runner.clone(),
        LocalOptions {
            delete: true,
            ..options()
        },
    )
    .await;

    let report = harness.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(runner.verbs("kapp"), vec!["delete"]);
    assert_eq!(runner.calls_to("imgpkg"), 0);
}

#[tokio::test]
async fn test_local_fetch_reads_annotated_directory() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("app.yml"), "kind: ConfigMap\n").unwrap();
    let yaml = BUNDLE_APP.replacen(
        "  name: demo\n",
        &format!(
            "  name: demo\n  annotations:\n    carton.dev/local-fetch-0: {}\n",
            workdir.path().display()
        ),
        1,
    );

    let runner = Arc::new(scripted());
    let local = harness(
        &yaml,
        runner.clone(),
        LocalOptions {
            local_fetch: true,
            ..options()
        },
    )
    .await;
    let report = local.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(runner.calls_to("imgpkg"), 0);
    let rendered = runner.calls().into_iter().find(|c| c.program == "ytt").unwrap();
    let input = String::from_utf8(rendered.stdin.unwrap()).unwrap();
    assert!(input.contains("kind: ConfigMap"));
    assert!(!input.contains("Deployment"));
    assert_eq!(runner.verbs("kapp"), vec!["deploy"]);

    // without the flag the annotation is inert
    let runner = Arc::new(scripted());
    let remote = harness(&yaml, runner.clone(), options()).await;
    assert_eq!(remote.run(|_| {}).await.unwrap().exit_code(), 0);
    assert_eq!(runner.calls_to("imgpkg"), 1);
}

#[tokio::test]
async fn test_records_keep_the_namespace_they_were_parsed_with() {
    let documents = Documents::parse(BUNDLE_APP, "staging").unwrap();
    let runner = Arc::new(scripted());
    let harness = LocalHarness::new(&documents, runner.clone(), Arc::new(StaticArtifacts::new()), options())
        .await
        .unwrap();
    assert_eq!(harness.records(), &[ObjectKey::new(APP_KIND, "staging", "demo")]);

    let report = harness.run(|_| {}).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    let deploy = runner.calls().into_iter().find(|c| c.program == "kapp").unwrap();
    assert!(deploy.args.windows(2).any(|w| w[0] == "--namespace" && w[1] == "staging"));
}

#[tokio::test]
async fn test_no_records_is_an_error() {
    let documents = Documents::parse(&package_versions(), DEFAULT_NAMESPACE).unwrap();
    let result = LocalHarness::new(
        &documents,
        Arc::new(ScriptedRunner::new()),
        Arc::new(StaticArtifacts::new()),
        options(),
    )
    .await;
    assert!(matches!(result, Err(CartonError::InvalidSpec(_))));
}

/// Reconciler over `store` without a version cache.
fn assemble(store: Arc<dyn ResourceStore>, runner: Arc<ScriptedRunner>) -> Reconciler {
    let executor = PipelineExecutor::new(
        runner,
        Arc::new(StaticArtifacts::new()),
        store.clone(),
        ExecutorConfig {
            store_retry: RetryPolicy::immediate(3),
            ..Default::default()
        },
    );
    let resolver = VersionResolver::new(store.clone()).with_retry_policy(RetryPolicy::immediate(3));
    Reconciler::new(store, resolver, executor, config())
}

/// Store whose PackageVersion lists fail while `down` is set.
struct FlakyCatalog {
    inner: MemoryResourceStore,
    down: AtomicBool,
}

#[async_trait]
impl ResourceStore for FlakyCatalog {
    async fn get(&self, key: &ObjectKey) -> StorageResult<StoredObject> {
        self.inner.get(key).await
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StorageResult<Vec<StoredObject>> {
        if kind == PACKAGE_VERSION_KIND && self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("catalog unreachable".into()));
        }
        self.inner.list(kind, namespace, selector).await
    }

    async fn create(&self, object: StoredObject) -> StorageResult<StoredObject> {
        self.inner.create(object).await
    }

    async fn update(&self, object: StoredObject) -> StorageResult<StoredObject> {
        self.inner.update(object).await
    }

    async fn update_status(&self, object: StoredObject) -> StorageResult<StoredObject> {
        self.inner.update_status(object).await
    }

    async fn patch(&self, key: &ObjectKey, patch: Value) -> StorageResult<StoredObject> {
        self.inner.patch(key, patch).await
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn watch(&self, kind: &str, namespace: Option<&str>) -> WatchStream {
        self.inner.watch(kind, namespace)
    }
}

#[tokio::test]
async fn test_transient_resolve_failure_of_new_generation_restarts_retries() {
    let catalog = Arc::new(FlakyCatalog {
        inner: MemoryResourceStore::new(),
        down: AtomicBool::new(false),
    });
    let documents = Documents::parse(
        &format!("{}{}", package_versions(), install("1.x")),
        DEFAULT_NAMESPACE,
    )
    .unwrap();
    documents
        .load_into(catalog.as_ref(), &RetryPolicy::immediate(3))
        .await
        .unwrap();

    let store: Arc<dyn ResourceStore> = catalog.clone();
    let runner = Arc::new(scripted().fail_times("kapp", 1, "connection refused"));
    let reconciler = assemble(store.clone(), runner);
    let request = key(INSTALL_REQUEST_KIND);
    let never = CancelToken::never();

    let first = reconciler.reconcile(&request, Trigger::Explicit, &never).await.unwrap();
    assert_eq!(first, Outcome::Failed { retry_in: Duration::from_secs(3600) });
    assert_eq!(record_status(&store.get(&request).await.unwrap()).retry_count, 1);

    let mut edited = store.get(&request).await.unwrap();
    edited.spec["packageRef"]["versionSelection"]["constraints"] = json!("1.0.x");
    let edited = store.update(edited).await.unwrap();
    assert_eq!(edited.metadata.generation, 2);
    catalog.down.store(true, Ordering::SeqCst);

    let second = reconciler.reconcile(&request, Trigger::Watch, &never).await.unwrap();
    assert_eq!(second, Outcome::Failed { retry_in: Duration::from_secs(3600) });
    let status = record_status(&store.get(&request).await.unwrap());
    assert_eq!(status.retry_count, 1);
    assert_eq!(status.observed_generation, 2);
    let condition = status.condition(ConditionType::ReconcileFailed).unwrap();
    assert!(condition.message.contains("catalog unreachable"));

    // the same generation keeps counting
    let third = reconciler.reconcile(&request, Trigger::Retry, &never).await.unwrap();
    assert_eq!(third, Outcome::Failed { retry_in: Duration::from_secs(7200) });
    assert_eq!(record_status(&store.get(&request).await.unwrap()).retry_count, 2);
}

fn start_controller(harness: &LocalHarness) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
    let (stop, stopped) = oneshot::channel::<()>();
    let controller = Controller::new(harness.reconciler().clone());
    let join = tokio::spawn(controller.run(async move {
        let _ = stopped.await;
    }));
    (stop, join)
}

#[tokio::test]
async fn test_spec_change_preempts_backoff_and_resets_retries() {
    let runner = Arc::new(scripted().fail_times("kapp", 1, "connection refused"));
    let harness = harness(BUNDLE_APP, runner.clone(), options()).await;
    let store = harness.store().clone();
    let app = key(APP_KIND);
    let (stop, join) = start_controller(&harness);

    eventually("first failure", || {
        let store = store.clone();
        let app = app.clone();
        async move { status(&store, &app).await.retry_count == 1 }
    })
    .await;

    // backoff is an hour; only the spec change can start the next run
    let mut edited = store.get(&app).await.unwrap();
    edited.spec["values"] = json!([{"inline": {"replicas": 2}}]);
    store.update(edited).await.unwrap();

    eventually("success after spec change", || {
        let store = store.clone();
        let app = app.clone();
        async move {
            let s = status(&store, &app).await;
            s.phase() == Phase::Succeeded && s.retry_count == 0
        }
    })
    .await;
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "deploy"]);

    stop.send(()).unwrap();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deletion_mid_run_cleans_up_exactly_once() {
    let runner = Arc::new(scripted().with_delay("imgpkg", Duration::from_millis(300)));
    let harness = harness(BUNDLE_APP, runner.clone(), options()).await;
    let store = harness.store().clone();
    let app = key(APP_KIND);
    let (stop, join) = start_controller(&harness);

    eventually("fetch in flight", || {
        let runner = runner.clone();
        async move { runner.calls_to("imgpkg") == 1 }
    })
    .await;
    store.delete(&app).await.unwrap();

    eventually("record removed", || {
        let store = store.clone();
        let app = app.clone();
        async move { store.get(&app).await.is_err() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(runner.verbs("kapp"), vec!["delete"]);
    assert_eq!(runner.calls_to("ytt"), 0);

    stop.send(()).unwrap();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_new_package_version_retriggers_install() {
    let runner = Arc::new(scripted());
    let yaml = format!("{}{}", package_versions(), install(">=3.0.0"));
    let harness = harness(&yaml, runner.clone(), options()).await;
    let store = harness.store().clone();
    let request = key(INSTALL_REQUEST_KIND);
    let (stop, join) = start_controller(&harness);

    eventually("blocked on missing version", || {
        let store = store.clone();
        let request = request.clone();
        async move { status(&store, &request).await.phase() == Phase::Failed }
    })
    .await;

    let published = Documents::parse(
        &package_versions().replace("2.0.0", "3.1.0"),
        DEFAULT_NAMESPACE,
    )
    .unwrap();
    let newest = published
        .get(&ObjectKey::new(PACKAGE_VERSION_KIND, DEFAULT_NAMESPACE, "demo.3.1.0"))
        .unwrap()
        .clone();
    store.create(newest).await.unwrap();

    eventually("install of the new version", || {
        let store = store.clone();
        let request = request.clone();
        async move {
            let s = status(&store, &request).await;
            s.phase() == Phase::Succeeded && s.resolved_version.as_deref() == Some("3.1.0")
        }
    })
    .await;

    stop.send(()).unwrap();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_lagged_watch_relists_and_tracks_missed_records() {
    let memory = Arc::new(MemoryResourceStore::with_watch_buffer(1));
    let documents = Documents::parse(BUNDLE_APP, DEFAULT_NAMESPACE).unwrap();
    documents
        .load_into(memory.as_ref(), &RetryPolicy::immediate(3))
        .await
        .unwrap();
    let runner = Arc::new(scripted());
    let reconciler = Arc::new(assemble(memory.clone(), runner.clone()));

    let (stop, stopped) = oneshot::channel::<()>();
    let join = tokio::spawn(Controller::new(reconciler).run(async move {
        let _ = stopped.await;
    }));
    eventually("first app deployed", || {
        let memory = memory.clone();
        async move { status(&memory, &key(APP_KIND)).await.phase() == Phase::Succeeded }
    })
    .await;

    // no await point yields here, so the controller's watches overflow
    let mut second = documents.get(&key(APP_KIND)).unwrap().clone();
    second.metadata.name = "second".to_string();
    memory.create(second).await.unwrap();
    for name in ["a", "b", "c"] {
        memory
            .create(StoredObject::new(SECRET_KIND, DEFAULT_NAMESPACE, name, json!({})))
            .await
            .unwrap();
    }

    let second = ObjectKey::new(APP_KIND, DEFAULT_NAMESPACE, "second");
    eventually("missed app deployed", || {
        let memory = memory.clone();
        let second = second.clone();
        async move { status(&memory, &second).await.phase() == Phase::Succeeded }
    })
    .await;
    assert_eq!(runner.verbs("kapp"), vec!["deploy", "deploy"]);

    stop.send(()).unwrap();
    join.await.unwrap().unwrap();
}
