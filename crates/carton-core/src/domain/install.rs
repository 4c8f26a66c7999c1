//! User-owned records: InstallRequest, App, and the Secret/ConfigMap
//! records that value sources point at.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::condition::ReconcileStatus;
use crate::domain::error::{CartonError, Result};
use crate::domain::pipeline::{DeployStep, FetchSource, TemplateStep};
use crate::domain::resource::ResourceSpec;

pub const INSTALL_REQUEST_KIND: &str = "InstallRequest";
pub const APP_KIND: &str = "App";
pub const SECRET_KIND: &str = "Secret";
pub const CONFIG_MAP_KIND: &str = "ConfigMap";

// ---------------------------------------------------------------------------
// Package references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereleaseSelection {
    /// Allowed first prerelease identifiers (e.g. `rc`, `beta`); empty
    /// allows every prerelease.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prereleases: Option<PrereleaseSelection>,
}

/// A loose reference to a package: a name and an optional version selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_selection: Option<VersionSelection>,
}

impl PackageRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            ref_name: name.into(),
            version_selection: None,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        let selection = self.version_selection.get_or_insert_with(Default::default);
        selection.constraints = Some(constraint.into());
        self
    }

    /// Parse `name` or `name/constraint`.
    pub fn parse(reference: &str) -> Result<Self> {
        let mut parts = reference.split('/');
        let name = parts.next().unwrap_or_default().trim();
        let constraint = parts.next();
        if parts.next().is_some() {
            return Err(CartonError::InvalidSpec(format!(
                "package reference '{reference}' must be 'name' or 'name/version'"
            )));
        }
        if name.is_empty() {
            return Err(CartonError::InvalidSpec(format!(
                "package reference '{reference}' has an empty name"
            )));
        }
        let package = PackageRef::named(name);
        match constraint.map(str::trim) {
            None => Ok(package),
            Some("") => Err(CartonError::InvalidSpec(format!(
                "package reference '{reference}' has an empty version"
            ))),
            Some(c) => Ok(package.with_constraint(c)),
        }
    }

    pub fn constraint(&self) -> Option<&str> {
        self.version_selection
            .as_ref()
            .and_then(|s| s.constraints.as_deref())
    }

    pub fn prereleases(&self) -> Option<&PrereleaseSelection> {
        self.version_selection
            .as_ref()
            .and_then(|s| s.prereleases.as_ref())
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constraint() {
            Some(c) => write!(f, "{}/{}", self.ref_name, c),
            None => f.write_str(&self.ref_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Value sources
// ---------------------------------------------------------------------------

/// Reference to a Secret or ConfigMap, optionally narrowed to one data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// One configuration source. References are recorded at synthesis time and
/// resolved when the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueSource {
    Inline(Value),
    SecretRef(DataRef),
    ConfigMapRef(DataRef),
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Inline(_) => f.write_str("inline"),
            ValueSource::SecretRef(r) => write!(f, "secret/{}", r.name),
            ValueSource::ConfigMapRef(r) => write!(f, "configmap/{}", r.name),
        }
    }
}

// ---------------------------------------------------------------------------
// InstallRequest
// ---------------------------------------------------------------------------

/// "Install package X at version Z with these values."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequestSpec {
    #[serde(default)]
    pub service_account_name: String,
    pub package_ref: PackageRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ValueSource>,
    /// Poll interval such as `10m`; `0` reconciles once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_period: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

impl ResourceSpec for InstallRequestSpec {
    const KIND: &'static str = INSTALL_REQUEST_KIND;
    type Status = ReconcileStatus;
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// A hand-declared pipeline, reconciled without version resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub service_account_name: String,
    #[serde(default)]
    pub fetch: Vec<FetchSource>,
    #[serde(default)]
    pub template: Vec<TemplateStep>,
    #[serde(default)]
    pub deploy: Vec<DeployStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ValueSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_period: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

impl ResourceSpec for AppSpec {
    const KIND: &'static str = APP_KIND;
    type Status = ReconcileStatus;
}

// ---------------------------------------------------------------------------
// Secret / ConfigMap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ResourceSpec for SecretSpec {
    const KIND: &'static str = SECRET_KIND;
    type Status = Value;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ResourceSpec for ConfigMapSpec {
    const KIND: &'static str = CONFIG_MAP_KIND;
    type Status = Value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let r = PackageRef::parse("demo").unwrap();
        assert_eq!(r.ref_name, "demo");
        assert_eq!(r.constraint(), None);
    }

    #[test]
    fn test_parse_name_and_constraint() {
        let r = PackageRef::parse("demo.example.com/>=1.0.0").unwrap();
        assert_eq!(r.ref_name, "demo.example.com");
        assert_eq!(r.constraint(), Some(">=1.0.0"));
        assert_eq!(r.to_string(), "demo.example.com/>=1.0.0");
    }

    #[test]
    fn test_parse_rejects_extra_segments() {
        assert!(matches!(
            PackageRef::parse("a/b/c"),
            Err(CartonError::InvalidSpec(_))
        ));
        assert!(PackageRef::parse("/1.0.0").is_err());
        assert!(PackageRef::parse("demo/").is_err());
    }

    #[test]
    fn test_install_request_document() {
        let yaml = r#"
serviceAccountName: installer
packageRef:
  refName: demo
  versionSelection:
    constraints: "1.x"
    prereleases: {}
values:
  - inline:
      replicas: 2
  - secretRef:
      name: demo-values
syncPeriod: 10m
"#;
        let spec: InstallRequestSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.package_ref.constraint(), Some("1.x"));
        assert!(spec.package_ref.prereleases().is_some());
        assert_eq!(spec.values.len(), 2);
        assert!(matches!(&spec.values[1], ValueSource::SecretRef(r) if r.name == "demo-values"));
        assert!(!spec.paused);
    }
}
