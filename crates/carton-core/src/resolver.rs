//! Version resolution.
//!
//! Turns a loose package reference into the single best published version:
//! list every `PackageVersion` of the name, drop unparsable versions, keep the
//! ones satisfying the constraint and return the maximum by semver order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use resource_store::{retry_transient, ResourceStore, RetryPolicy, Selector};
use semver::{Version, VersionReq};
use tracing::debug;

use crate::domain::error::{CartonError, Result};
use crate::domain::install::{PackageRef, PrereleaseSelection};
use crate::domain::package::PackageVersionSpec;
use crate::domain::resource::{Object, ResourceSpec};

/// A parsed version constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// No constraint: the highest published version.
    Any,
    /// A plain version string selects exactly that version.
    Exact(Version),
    Req(VersionReq),
}

impl Constraint {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let raw = match raw.map(str::trim) {
            None | Some("") | Some("*") => return Ok(Constraint::Any),
            Some(r) => r,
        };
        if let Ok(version) = Version::parse(raw.strip_prefix('v').unwrap_or(raw)) {
            return Ok(Constraint::Exact(version));
        }
        let normalized = raw.replace(".x", ".*").replace(".X", ".*");
        VersionReq::parse(&normalized)
            .map(Constraint::Req)
            .map_err(|e| CartonError::InvalidSpec(format!("invalid version constraint '{raw}': {e}")))
    }

    /// Whether `version` is acceptable under this constraint.
    ///
    /// `Any` accepts every version, prereleases included, so the maximum by
    /// semver precedence wins. Under a requirement, prereleases are only
    /// considered when `prereleases` is set; a candidate is then judged by its
    /// release triple. Identifiers, when given, must list the candidate's
    /// first prerelease identifier.
    pub fn matches(&self, version: &Version, prereleases: Option<&PrereleaseSelection>) -> bool {
        if let Constraint::Exact(exact) = self {
            return exact == version;
        }
        if version.pre.is_empty() {
            return match self {
                Constraint::Req(req) => req.matches(version),
                _ => true,
            };
        }

        let selection = match (self, prereleases) {
            (_, Some(selection)) => selection,
            (Constraint::Any, None) => return true,
            (_, None) => return false,
        };
        if !selection.identifiers.is_empty() {
            let first = version.pre.as_str().split('.').next().unwrap_or_default();
            if !selection.identifiers.iter().any(|id| id == first) {
                return false;
            }
        }
        match self {
            Constraint::Req(req) => {
                let release = Version::new(version.major, version.minor, version.patch);
                req.matches(&release) || req.matches(version)
            }
            _ => true,
        }
    }
}

/// Pick the highest candidate satisfying `package`'s selection.
///
/// `candidates` are published versions of one package; unparsable version
/// strings are skipped.
pub fn select_version<'a>(
    package: &PackageRef,
    candidates: &'a [Object<PackageVersionSpec>],
) -> Result<&'a Object<PackageVersionSpec>> {
    if candidates.is_empty() {
        return Err(CartonError::not_found("Package", &package.ref_name));
    }
    let constraint = Constraint::parse(package.constraint())?;
    let prereleases = package.prereleases();

    let mut parsed: Vec<(Version, &Object<PackageVersionSpec>)> = candidates
        .iter()
        .filter_map(|candidate| match Version::parse(&candidate.spec.version) {
            Ok(v) => Some((v, candidate)),
            Err(e) => {
                debug!(package = %package.ref_name, version = %candidate.spec.version, error = %e, "skipping unparsable version");
                None
            }
        })
        .collect();
    parsed.sort_by(|a, b| a.0.cmp(&b.0));

    let available = parsed
        .iter()
        .map(|(v, _)| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    parsed
        .iter()
        .rev()
        .find(|(v, _)| constraint.matches(v, prereleases))
        .map(|(_, candidate)| *candidate)
        .ok_or_else(|| CartonError::NoMatchingVersion {
            package: package.ref_name.clone(),
            constraint: package.constraint().unwrap_or("*").to_string(),
            available,
        })
}

type CacheKey = (String, String);

/// Published versions cached per (namespace, package name).
///
/// Entries are dropped explicitly when a version of that package is
/// published, changed or removed.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: Mutex<HashMap<CacheKey, Arc<Vec<Object<PackageVersionSpec>>>>>,
}

impl VersionCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Vec<Object<PackageVersionSpec>>>> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn insert(&self, namespace: &str, name: &str, versions: Arc<Vec<Object<PackageVersionSpec>>>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((namespace.to_string(), name.to_string()), versions);
        }
    }

    pub fn invalidate(&self, namespace: &str, name: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
            {
                debug!(namespace, package = name, "version cache invalidated");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves package references against the published versions in a store.
pub struct VersionResolver {
    store: Arc<dyn ResourceStore>,
    retry: RetryPolicy,
    cache: Option<VersionCache>,
}

impl VersionResolver {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            cache: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cache listings per package; callers must call [`Self::invalidate`]
    /// when versions of a package change.
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(VersionCache::default());
        self
    }

    pub fn invalidate(&self, namespace: &str, package: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(namespace, package);
        }
    }

    pub fn cache(&self) -> Option<&VersionCache> {
        self.cache.as_ref()
    }

    /// All published versions of `package` in `namespace`, in store order.
    pub async fn published_versions(
        &self,
        namespace: &str,
        package: &str,
    ) -> Result<Arc<Vec<Object<PackageVersionSpec>>>> {
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(namespace, package)) {
            return Ok(hit);
        }

        let selector = Selector::everything();
        let stored = retry_transient(&self.retry, "list-versions", || {
            self.store
                .list(PackageVersionSpec::KIND, Some(namespace), &selector)
        })
        .await?;

        let mut versions = Vec::new();
        for object in stored {
            let version = Object::<PackageVersionSpec>::from_stored(object)?;
            if version.spec.ref_name == package {
                versions.push(version);
            }
        }
        let versions = Arc::new(versions);
        if let Some(cache) = &self.cache {
            cache.insert(namespace, package, versions.clone());
        }
        Ok(versions)
    }

    /// Resolve `package` to one concrete published version.
    pub async fn resolve(
        &self,
        namespace: &str,
        package: &PackageRef,
    ) -> Result<Object<PackageVersionSpec>> {
        let versions = self.published_versions(namespace, &package.ref_name).await?;
        let selected = select_version(package, &versions)?;
        debug!(
            package = %package.ref_name,
            constraint = package.constraint().unwrap_or("*"),
            version = %selected.spec.version,
            "resolved package version"
        );
        Ok(selected.clone())
    }
}
