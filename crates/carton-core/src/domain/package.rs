//! Published package records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::pipeline::PipelineTemplate;
use crate::domain::resource::ResourceSpec;

pub const PACKAGE_METADATA_KIND: &str = "PackageMetadata";
pub const PACKAGE_VERSION_KIND: &str = "PackageVersion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: String,
}

/// Descriptive information shared by every version of a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadataSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub maintainers: Vec<Maintainer>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub support_description: String,
}

impl ResourceSpec for PackageMetadataSpec {
    const KIND: &'static str = PACKAGE_METADATA_KIND;
    type Status = Value;
}

/// One immutable, published build pipeline of a named package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersionSpec {
    pub ref_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub licenses: Vec<String>,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub capacity_requirements_description: String,
    pub template: PipelineTemplate,
}

impl ResourceSpec for PackageVersionSpec {
    const KIND: &'static str = PACKAGE_VERSION_KIND;
    type Status = Value;
}

/// Object name under which a version is published: `<package>.<version>`.
pub fn package_version_name(package: &str, version: &str) -> String {
    format!("{package}.{version}")
}
