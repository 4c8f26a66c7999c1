//! Pipeline templates and the synthesized PipelineSpec.
//!
//! Stage descriptors are closed sum types: every fetch, template and deploy
//! driver is one variant, tagged in documents by its camelCase name, e.g.
//!
//! ```yaml
//! fetch:
//!   - imgpkgBundle:
//!       image: registry.example.com/demo@sha256:...
//! template:
//!   - ytt: {}
//!   - kbld: {}
//! deploy:
//!   - kapp: {}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::digest::Fingerprint;
use crate::domain::error::Result;
use crate::domain::install::ValueSource;

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRef {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImgpkgBundleSource {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubReleaseSource {
    /// `owner/repo`
    pub slug: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDirectorySource {
    pub path: String,
}

/// One fetch source; exactly one driver runs per declared source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchSource {
    ImgpkgBundle(ImgpkgBundleSource),
    GithubRelease(GithubReleaseSource),
    HelmChart(HelmChartSource),
    LocalDirectory(LocalDirectorySource),
}

impl FetchSource {
    pub fn driver_name(&self) -> &'static str {
        match self {
            FetchSource::ImgpkgBundle(_) => "imgpkgBundle",
            FetchSource::GithubRelease(_) => "githubRelease",
            FetchSource::HelmChart(_) => "helmChart",
            FetchSource::LocalDirectory(_) => "localDirectory",
        }
    }

    /// Sources that authenticate against a registry and fall back to a
    /// generated placeholder credential when no secret is referenced.
    pub fn needs_placeholder_secret(&self) -> bool {
        match self {
            FetchSource::ImgpkgBundle(s) => s.secret_ref.is_none(),
            FetchSource::GithubRelease(s) => s.secret_ref.is_none(),
            FetchSource::HelmChart(_) | FetchSource::LocalDirectory(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YttStep {
    /// Staging-relative paths; empty means every fetch directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbldStep {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmTemplateStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Chart directory relative to the staging area; defaults to `fetch/0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuesStep {
    pub sources: Vec<ValueSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateStep {
    Ytt(YttStep),
    Kbld(KbldStep),
    HelmTemplate(HelmTemplateStep),
    /// Resolves value sources into `values/values.yml` for later steps.
    Values(ValuesStep),
}

impl TemplateStep {
    pub fn driver_name(&self) -> &'static str {
        match self {
            TemplateStep::Ytt(_) => "ytt",
            TemplateStep::Kbld(_) => "kbld",
            TemplateStep::HelmTemplate(_) => "helmTemplate",
            TemplateStep::Values(_) => "values",
        }
    }
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KappDeployStep {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_options: Vec<String>,
    /// Filled in at synthesis time from the request's service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeployStep {
    Kapp(KappDeployStep),
}

impl DeployStep {
    pub fn driver_name(&self) -> &'static str {
        match self {
            DeployStep::Kapp(_) => "kapp",
        }
    }

    pub fn with_service_account(mut self, service_account: &str) -> Self {
        match &mut self {
            DeployStep::Kapp(step) => step.service_account_name = Some(service_account.to_string()),
        }
        self
    }
}

/// The build pipeline carried by a PackageVersion or declared on an App.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    #[serde(default)]
    pub fetch: Vec<FetchSource>,
    #[serde(default)]
    pub template: Vec<TemplateStep>,
    #[serde(default)]
    pub deploy: Vec<DeployStep>,
}

// ---------------------------------------------------------------------------
// PipelineSpec
// ---------------------------------------------------------------------------

/// Fully resolved fetch/template/deploy document ready for execution.
///
/// Derived from a template plus install-time overrides; never edited by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Application name used by the applier and for placeholder credentials.
    pub app_name: String,
    pub namespace: String,
    pub service_account_name: String,
    pub fetch: Vec<FetchSource>,
    pub template: Vec<TemplateStep>,
    pub deploy: DeployStep,
    /// Excluded from its own digest.
    pub fingerprint: Fingerprint,
}

/// Annotation prefix naming a local directory that replaces the fetch source
/// at the suffixed index, e.g. `carton.dev/local-fetch-0: ./config`.
pub const LOCAL_FETCH_ANNOTATION_PREFIX: &str = "carton.dev/local-fetch-";

/// Everything a fingerprint covers.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintBody<'a> {
    app_name: &'a str,
    namespace: &'a str,
    service_account_name: &'a str,
    fetch: &'a [FetchSource],
    template: &'a [TemplateStep],
    deploy: &'a DeployStep,
}

impl PipelineSpec {
    /// Build a spec and stamp it with its fingerprint.
    pub fn new(
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        service_account_name: impl Into<String>,
        fetch: Vec<FetchSource>,
        template: Vec<TemplateStep>,
        deploy: DeployStep,
    ) -> Result<Self> {
        let app_name = app_name.into();
        let namespace = namespace.into();
        let service_account_name = service_account_name.into();
        let fingerprint = Fingerprint::of(&FingerprintBody {
            app_name: &app_name,
            namespace: &namespace,
            service_account_name: &service_account_name,
            fetch: &fetch,
            template: &template,
            deploy: &deploy,
        })?;
        Ok(Self {
            app_name,
            namespace,
            service_account_name,
            fetch,
            template,
            deploy,
            fingerprint,
        })
    }

    /// Digest of every field except `fingerprint` itself.
    pub fn compute_fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::of(&FingerprintBody {
            app_name: &self.app_name,
            namespace: &self.namespace,
            service_account_name: &self.service_account_name,
            fetch: &self.fetch,
            template: &self.template,
            deploy: &self.deploy,
        })
    }

    /// Swap fetch sources for the local directories named by
    /// [`LOCAL_FETCH_ANNOTATION_PREFIX`] annotations and re-stamp the
    /// fingerprint. Indexes past the declared sources are ignored.
    pub fn with_local_fetch(mut self, annotations: &BTreeMap<String, String>) -> Result<Self> {
        let mut replaced = false;
        for (key, path) in annotations {
            let Some(index) = key
                .strip_prefix(LOCAL_FETCH_ANNOTATION_PREFIX)
                .and_then(|i| i.parse::<usize>().ok())
            else {
                continue;
            };
            if let Some(source) = self.fetch.get_mut(index) {
                *source = FetchSource::LocalDirectory(LocalDirectorySource { path: path.clone() });
                replaced = true;
            }
        }
        if replaced {
            self.fingerprint = self.compute_fingerprint()?;
        }
        Ok(self)
    }

    /// Value sources referenced by the values step, if any.
    pub fn value_sources(&self) -> &[ValueSource] {
        self.template
            .iter()
            .find_map(|step| match step {
                TemplateStep::Values(v) => Some(v.sources.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}
