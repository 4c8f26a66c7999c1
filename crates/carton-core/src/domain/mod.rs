//! Domain models for Carton.
//!
//! Canonical definitions for the core entities:
//! - `PackageMetadata` / `PackageVersion`: published packages
//! - `InstallRequest` / `App`: user declarations to reconcile
//! - `PipelineSpec`: the synthesized fetch/template/deploy document
//! - `ReconcileStatus`: controller-owned conditions and retry state

pub mod condition;
pub mod digest;
pub mod error;
pub mod install;
pub mod package;
pub mod pipeline;
pub mod resource;

pub use condition::{
    Condition, ConditionStatus, ConditionType, Phase, ReconcileStatus, DEFAULT_HISTORY_LIMIT,
};
pub use digest::{canonical_json, compute_digest, digest_bytes, Fingerprint};
pub use error::{CartonError, Result, StageFailure, StageKind};
pub use install::{
    AppSpec, ConfigMapSpec, DataRef, InstallRequestSpec, PackageRef, PrereleaseSelection,
    SecretSpec, ValueSource, VersionSelection, APP_KIND, CONFIG_MAP_KIND, INSTALL_REQUEST_KIND,
    SECRET_KIND,
};
pub use package::{
    package_version_name, Maintainer, PackageMetadataSpec, PackageVersionSpec,
    PACKAGE_METADATA_KIND, PACKAGE_VERSION_KIND,
};
pub use pipeline::{
    DeployStep, FetchSource, GithubReleaseSource, HelmChartSource, HelmTemplateStep,
    ImgpkgBundleSource, KappDeployStep, KbldStep, LocalDirectorySource, LocalRef, PipelineSpec,
    PipelineTemplate, TemplateStep, ValuesStep, YttStep, LOCAL_FETCH_ANNOTATION_PREFIX,
};
pub use resource::{create_object, get_object, list_objects, Object, ResourceSpec};
