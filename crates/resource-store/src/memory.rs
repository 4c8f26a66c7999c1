//! In-memory resource store
//!
//! `MemoryResourceStore` satisfies the [`ResourceStore`] contract without any
//! external dependencies. It backs the local simulation harness and every
//! test in the workspace. Faults can be queued with [`MemoryResourceStore::inject_fault`]
//! to exercise retry paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::*;

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, StoredObject>,
    last_version: u64,
    faults: VecDeque<StorageError>,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn take_fault(&mut self) -> StorageResult<()> {
        match self.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory store backed by a `BTreeMap<ObjectKey, StoredObject>` and a
/// broadcast channel for watchers.
#[derive(Debug)]
pub struct MemoryResourceStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::with_watch_buffer(WATCH_BUFFER)
    }

    /// Store whose watchers buffer at most `capacity` undelivered events
    /// before they see [`WatchEventType::Lagged`].
    pub fn with_watch_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Queue an error to be returned by the next store operation.
    ///
    /// Faults are consumed in FIFO order, one per operation.
    pub fn inject_fault(&self, err: StorageError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.push_back(err);
        }
    }

    /// Number of objects currently stored (including ones pending deletion).
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("store lock poisoned".to_string()))
    }

    fn emit(&self, event_type: WatchEventType, object: &StoredObject) {
        // No receivers is not an error: nobody is watching yet.
        let _ = self.events.send(WatchEvent {
            event_type,
            object: object.clone(),
        });
    }

    fn stale(key: &ObjectKey, expected: u64, actual: u64) -> StorageError {
        StorageError::Conflict {
            key: key.to_string(),
            expected,
            actual,
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get(&self, key: &ObjectKey) -> StorageResult<StoredObject> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StorageResult<Vec<StoredObject>> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        Ok(inner
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .filter(|o| namespace.map_or(true, |ns| o.metadata.namespace == ns))
            .filter(|o| selector.matches(&o.metadata))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: StoredObject) -> StorageResult<StoredObject> {
        if object.metadata.name.is_empty() {
            return Err(StorageError::Invalid(format!(
                "{} object must have a name",
                object.kind
            )));
        }
        let mut inner = self.lock()?;
        inner.take_fault()?;
        let key = object.key();
        if inner.objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        object.metadata.uid = Uuid::new_v4().to_string();
        object.metadata.resource_version = inner.next_version();
        object.metadata.generation = 1;
        object.metadata.deletion_timestamp = None;
        object.metadata.creation_timestamp = Some(Utc::now());
        inner.objects.insert(key.clone(), object.clone());
        debug!(key = %key, rv = object.metadata.resource_version, "created");
        self.emit(WatchEventType::Added, &object);
        Ok(object)
    }

    async fn update(&self, object: StoredObject) -> StorageResult<StoredObject> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        let key = object.key();
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(Self::stale(
                &key,
                object.metadata.resource_version,
                current.metadata.resource_version,
            ));
        }

        let mut next = current.clone();
        if next.spec != object.spec {
            next.spec = object.spec;
            next.metadata.generation += 1;
        }
        next.metadata.labels = object.metadata.labels;
        next.metadata.annotations = object.metadata.annotations;
        next.metadata.finalizers = object.metadata.finalizers;
        next.metadata.resource_version = inner.next_version();

        if next.is_deleting() && next.metadata.finalizers.is_empty() {
            inner.objects.remove(&key);
            debug!(key = %key, "finalizers cleared; removed");
            self.emit(WatchEventType::Deleted, &next);
        } else {
            inner.objects.insert(key, next.clone());
            self.emit(WatchEventType::Modified, &next);
        }
        Ok(next)
    }

    async fn update_status(&self, object: StoredObject) -> StorageResult<StoredObject> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        let key = object.key();
        let version = inner.next_version();
        let current = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(Self::stale(
                &key,
                object.metadata.resource_version,
                current.metadata.resource_version,
            ));
        }
        current.status = object.status;
        current.metadata.resource_version = version;
        let updated = current.clone();
        self.emit(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn patch(&self, key: &ObjectKey, patch: Value) -> StorageResult<StoredObject> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        let version = inner.next_version();
        let current = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let mut spec = current.spec.clone();
        merge_patch(&mut spec, &patch);
        if spec != current.spec {
            current.spec = spec;
            current.metadata.generation += 1;
        }
        current.metadata.resource_version = version;
        let updated = current.clone();
        self.emit(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        let mut inner = self.lock()?;
        inner.take_fault()?;
        let version = inner.next_version();
        let current = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;

        if current.metadata.finalizers.is_empty() {
            if let Some(removed) = inner.objects.remove(key) {
                self.emit(WatchEventType::Deleted, &removed);
            }
            return Ok(());
        }

        if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Utc::now());
            current.metadata.resource_version = version;
            let marked = current.clone();
            debug!(key = %key, finalizers = ?marked.metadata.finalizers, "deletion pending finalizers");
            self.emit(WatchEventType::Modified, &marked);
        }
        Ok(())
    }

    fn watch(&self, kind: &str, namespace: Option<&str>) -> WatchStream {
        let rx = self.events.subscribe();
        let kind = kind.to_string();
        let namespace = namespace.map(str::to_string);

        futures::stream::unfold(rx, move |mut rx| {
            let kind = kind.clone();
            let namespace = namespace.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let object = &event.object;
                            let in_scope = object.kind == kind
                                && namespace
                                    .as_deref()
                                    .map_or(true, |ns| object.metadata.namespace == ns);
                            if in_scope {
                                return Some((event, rx));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(kind = %kind, skipped, "watch lagged; events dropped");
                            return Some((WatchEvent::lagged(&kind, namespace.as_deref()), rx));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
