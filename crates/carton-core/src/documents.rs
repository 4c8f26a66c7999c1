//! Multi-document YAML input for local runs and offline package queries.
//!
//! Each document is one record tagged by kind:
//!
//! ```yaml
//! kind: InstallRequest
//! metadata:
//!   name: demo
//! spec:
//!   packageRef:
//!     refName: demo
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use resource_store::{retry_transient, ObjectKey, ResourceStore, RetryPolicy, StoredObject};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::error::{CartonError, Result};
use crate::domain::install::{APP_KIND, CONFIG_MAP_KIND, INSTALL_REQUEST_KIND, SECRET_KIND};
use crate::domain::package::{PACKAGE_METADATA_KIND, PACKAGE_VERSION_KIND};

pub const DEFAULT_NAMESPACE: &str = "default";

const KNOWN_KINDS: &[&str] = &[
    PACKAGE_METADATA_KIND,
    PACKAGE_VERSION_KIND,
    INSTALL_REQUEST_KIND,
    APP_KIND,
    SECRET_KIND,
    CONFIG_MAP_KIND,
];

/// Records loaded from YAML, indexed by (kind, namespace, name).
#[derive(Debug, Clone, Default)]
pub struct Documents {
    objects: BTreeMap<ObjectKey, StoredObject>,
    /// Keys in input order.
    order: Vec<ObjectKey>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML stream. Records without a namespace get `namespace`.
    pub fn parse(content: &str, namespace: &str) -> Result<Self> {
        let mut docs = Self::new();
        docs.add_yaml(content, namespace, "<input>")?;
        Ok(docs)
    }

    /// Load and merge several files, in order.
    pub fn from_files<P: AsRef<Path>>(paths: &[P], namespace: &str) -> Result<Self> {
        let mut docs = Self::new();
        for path in paths {
            let path = path.as_ref();
            let content = std::fs::read_to_string(path).map_err(|e| {
                CartonError::InvalidSpec(format!("reading {}: {e}", path.display()))
            })?;
            docs.add_yaml(&content, namespace, &path.display().to_string())?;
        }
        Ok(docs)
    }

    fn add_yaml(&mut self, content: &str, namespace: &str, origin: &str) -> Result<()> {
        for (index, part) in serde_yaml::Deserializer::from_str(content).enumerate() {
            let value = serde_yaml::Value::deserialize(part)
                .map_err(|e| CartonError::InvalidSpec(format!("{origin} document {index}: {e}")))?;
            if value.is_null() {
                continue;
            }
            let mut object: StoredObject = serde_yaml::from_value(value)
                .map_err(|e| CartonError::InvalidSpec(format!("{origin} document {index}: {e}")))?;
            if object.metadata.namespace.is_empty() {
                object.metadata.namespace = namespace.to_string();
            }
            if !KNOWN_KINDS.contains(&object.kind.as_str()) {
                warn!(kind = %object.kind, name = %object.metadata.name, "unknown kind; loaded as-is");
            }
            self.insert(object)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, object: StoredObject) -> Result<()> {
        let key = object.key();
        if self.objects.contains_key(&key) {
            return Err(CartonError::InvalidSpec(format!("duplicate document {key}")));
        }
        self.order.push(key.clone());
        self.objects.insert(key, object);
        Ok(())
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&StoredObject> {
        self.objects.get(key)
    }

    /// Records of one kind, in input order.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StoredObject> + 'a {
        self.iter().filter(move |o| o.kind == kind)
    }

    /// All records, in input order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredObject> {
        self.order.iter().filter_map(|key| self.objects.get(key))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Create every record in `store`, in input order.
    pub async fn load_into(&self, store: &dyn ResourceStore, retry: &RetryPolicy) -> Result<()> {
        for object in self.iter() {
            let created = retry_transient(retry, "create", || store.create(object.clone())).await?;
            debug!(key = %created.key(), "seeded record");
        }
        Ok(())
    }
}
