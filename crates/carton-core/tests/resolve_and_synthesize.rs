//! Resolution and synthesis against a seeded store.

use std::sync::Arc;

use carton_core::*;
use resource_store::{MemoryResourceStore, ResourceStore, RetryPolicy, StorageError};

fn version_doc(version: &str) -> String {
    format!(
        r#"
kind: PackageVersion
metadata:
  name: demo.{version}
spec:
  refName: demo
  version: "{version}"
  template:
    fetch:
      - imgpkgBundle:
          image: registry.example.com/demo:{version}
    template:
      - ytt: {{}}
    deploy:
      - kapp: {{}}
---
"#
    )
}

async fn seeded(versions: &[&str]) -> Arc<MemoryResourceStore> {
    let yaml: String = versions.iter().map(|v| version_doc(v)).collect();
    let docs = Documents::parse(&yaml, "default").unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    docs.load_into(store.as_ref(), &RetryPolicy::immediate(1))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn wildcard_constraint_selects_highest_in_range() {
    let store = seeded(&["1.0.0", "1.2.0", "2.0.0"]).await;
    let resolver = VersionResolver::new(store);
    let package = PackageRef::parse("demo/1.x").unwrap();
    let resolved = resolver.resolve("default", &package).await.unwrap();
    assert_eq!(resolved.spec.version, "1.2.0");
    assert_eq!(resolved.name(), "demo.1.2.0");
}

#[tokio::test]
async fn unsatisfiable_constraint_reports_no_matching_version() {
    let store = seeded(&["1.0.0", "1.2.0", "2.0.0"]).await;
    let resolver = VersionResolver::new(store);
    let package = PackageRef::parse("demo/>=3.0.0").unwrap();
    let err = resolver.resolve("default", &package).await.unwrap_err();
    assert!(matches!(err, CartonError::NoMatchingVersion { .. }));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn unknown_package_is_not_found() {
    let store = seeded(&["1.0.0"]).await;
    let resolver = VersionResolver::new(store);
    let err = resolver
        .resolve("default", &PackageRef::named("other"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "NotFound");
}

#[tokio::test]
async fn cached_listing_refreshes_after_invalidation() {
    let store = seeded(&["1.0.0"]).await;
    let resolver = VersionResolver::new(store.clone()).with_cache();
    let package = PackageRef::named("demo");
    assert_eq!(
        resolver.resolve("default", &package).await.unwrap().spec.version,
        "1.0.0"
    );

    let newer = Documents::parse(&version_doc("1.1.0"), "default").unwrap();
    newer
        .load_into(store.as_ref(), &RetryPolicy::immediate(1))
        .await
        .unwrap();
    assert_eq!(
        resolver.resolve("default", &package).await.unwrap().spec.version,
        "1.0.0"
    );

    resolver.invalidate("default", "demo");
    assert_eq!(
        resolver.resolve("default", &package).await.unwrap().spec.version,
        "1.1.0"
    );
}

#[tokio::test]
async fn transient_listing_failure_is_retried() {
    let store = seeded(&["1.0.0"]).await;
    store.inject_fault(StorageError::Unavailable("connection reset".into()));
    let resolver = VersionResolver::new(store).with_retry_policy(RetryPolicy::immediate(3));
    let resolved = resolver
        .resolve("default", &PackageRef::named("demo"))
        .await
        .unwrap();
    assert_eq!(resolved.spec.version, "1.0.0");
}

#[tokio::test]
async fn synthesized_pipeline_is_stable_across_resolutions() {
    let store = seeded(&["1.0.0", "1.2.0"]).await;
    let install_yaml = r#"
kind: InstallRequest
metadata:
  name: demo
spec:
  serviceAccountName: installer
  packageRef:
    refName: demo
  values:
    - configMapRef:
        name: demo-values
"#;
    let docs = Documents::parse(install_yaml, "default").unwrap();
    docs.load_into(store.as_ref(), &RetryPolicy::immediate(1))
        .await
        .unwrap();
    let install: Object<InstallRequestSpec> =
        get_object(store.as_ref() as &dyn ResourceStore, "default", "demo")
            .await
            .unwrap();

    let resolver = VersionResolver::new(store);
    let first = resolver
        .resolve("default", &install.spec.package_ref)
        .await
        .unwrap();
    let second = resolver
        .resolve("default", &install.spec.package_ref)
        .await
        .unwrap();

    let a = synthesize_install(&first, &install).unwrap();
    let b = synthesize_install(&second, &install).unwrap();
    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(a.fetch.len(), 1);
    assert_eq!(a.value_sources().len(), 1);
}
