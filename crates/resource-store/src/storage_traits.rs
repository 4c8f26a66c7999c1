//! Storage trait definitions for Carton
//!
//! The resource store is a namespaced, typed, watchable key-value store of
//! declarative records. Every record carries:
//! - `metadata`: identity, labels, optimistic-concurrency `resource_version`,
//!   `generation` (bumped only on spec changes), finalizers
//! - `spec`: the desired state, owned by the user
//! - `status`: the observed state, owned by the controller
//!
//! The trait is async and backend-agnostic. An in-memory implementation is
//! provided in the `memory` module.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Unique key of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Object metadata shared by every kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Store-assigned identity; differs between two objects that reused a name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Store-assigned version, compared on every optimistic write.
    #[serde(default)]
    pub resource_version: u64,
    /// Incremented whenever `spec` changes.
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A stored resource record with untyped spec/status payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl StoredObject {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            spec,
            status: Value::Null,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.metadata.namespace, &self.metadata.name)
    }

    /// Whether deletion was requested but finalizers are still pending.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Exact-match label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k).is_some_and(|actual| actual == v))
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Type of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    /// The subscriber fell behind and events were dropped. `object` carries
    /// only the watched kind and namespace; re-list to catch up.
    Lagged,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: StoredObject,
}

impl WatchEvent {
    /// Marker for dropped events on a watch of `kind`.
    pub fn lagged(kind: &str, namespace: Option<&str>) -> Self {
        Self {
            event_type: WatchEventType::Lagged,
            object: StoredObject::new(kind, namespace.unwrap_or_default(), "", Value::Null),
        }
    }
}

/// Long-lived change stream for one kind (optionally one namespace).
///
/// Events for a single object are delivered in the order they were applied.
pub type WatchStream = BoxStream<'static, WatchEvent>;

// ---------------------------------------------------------------------------
// ResourceStore
// ---------------------------------------------------------------------------

/// Declarative resource store.
///
/// Guarantees:
/// - `create` assigns `resource_version` and sets `generation` to 1.
/// - `update` and `update_status` fail with `StorageError::Conflict` if the
///   object's `resource_version` is stale; callers re-read and reapply.
/// - `update` replaces spec and mutable metadata and never touches status;
///   `update_status` replaces status only and never bumps `generation`.
/// - `delete` on an object with finalizers only sets `deletion_timestamp`;
///   the object is removed once its last finalizer is cleared.
/// - Any operation may fail with `StorageError::Unavailable`, which is
///   transient and safe to retry.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch one object. Returns `StorageError::NotFound` if absent.
    async fn get(&self, key: &ObjectKey) -> StorageResult<StoredObject>;

    /// List objects of a kind, optionally restricted to one namespace,
    /// ordered by (namespace, name).
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StorageResult<Vec<StoredObject>>;

    /// Create a new object. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, object: StoredObject) -> StorageResult<StoredObject>;

    /// Replace spec and metadata (labels, annotations, finalizers).
    async fn update(&self, object: StoredObject) -> StorageResult<StoredObject>;

    /// Replace the status section only.
    async fn update_status(&self, object: StoredObject) -> StorageResult<StoredObject>;

    /// Apply an RFC 7386 JSON merge patch to `spec`.
    async fn patch(&self, key: &ObjectKey, patch: Value) -> StorageResult<StoredObject>;

    /// Request deletion of an object.
    async fn delete(&self, key: &ObjectKey) -> StorageResult<()>;

    /// Subscribe to changes of a kind. Events applied after this call
    /// returns are guaranteed to be delivered.
    fn watch(&self, kind: &str, namespace: Option<&str>) -> WatchStream;
}

/// Apply an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
