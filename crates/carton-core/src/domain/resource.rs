//! Typed views over stored records.

use std::fmt::Debug;

use resource_store::{ObjectKey, ObjectMeta, ResourceStore, Selector, StoredObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::error::{CartonError, Result};

/// A record kind with a typed spec and status.
pub trait ResourceSpec: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    const KIND: &'static str;
    type Status: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync + 'static;
}

/// A record decoded into its typed spec and status.
#[derive(Debug, Clone)]
pub struct Object<S: ResourceSpec> {
    pub metadata: ObjectMeta,
    pub spec: S,
    pub status: S::Status,
}

impl<S: ResourceSpec> Object<S> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            spec,
            status: S::Status::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(S::KIND, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn from_stored(object: StoredObject) -> Result<Self> {
        if object.kind != S::KIND {
            return Err(CartonError::InvalidSpec(format!(
                "expected kind {}, got {}",
                S::KIND,
                object.kind
            )));
        }
        let spec = serde_json::from_value(object.spec).map_err(|e| {
            CartonError::InvalidSpec(format!(
                "{} {}/{}: {e}",
                S::KIND,
                object.metadata.namespace,
                object.metadata.name
            ))
        })?;
        let status = decode_status::<S>(object.status)?;
        Ok(Self {
            metadata: object.metadata,
            spec,
            status,
        })
    }

    pub fn to_stored(&self) -> Result<StoredObject> {
        Ok(StoredObject {
            kind: S::KIND.to_string(),
            metadata: self.metadata.clone(),
            spec: serde_json::to_value(&self.spec)?,
            status: serde_json::to_value(&self.status)?,
        })
    }
}

/// Decode a status payload; an absent status yields the default.
pub fn decode_status<S: ResourceSpec>(status: Value) -> Result<S::Status> {
    if status.is_null() {
        return Ok(S::Status::default());
    }
    Ok(serde_json::from_value(status)?)
}

pub async fn get_object<S: ResourceSpec>(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<Object<S>> {
    let key = ObjectKey::new(S::KIND, namespace, name);
    match store.get(&key).await {
        Ok(object) => Object::from_stored(object),
        Err(err) if err.is_not_found() => Err(CartonError::not_found(
            S::KIND,
            format!("{namespace}/{name}"),
        )),
        Err(err) => Err(err.into()),
    }
}

pub async fn list_objects<S: ResourceSpec>(
    store: &dyn ResourceStore,
    namespace: Option<&str>,
    selector: &Selector,
) -> Result<Vec<Object<S>>> {
    store
        .list(S::KIND, namespace, selector)
        .await?
        .into_iter()
        .map(Object::from_stored)
        .collect()
}

pub async fn create_object<S: ResourceSpec>(
    store: &dyn ResourceStore,
    object: &Object<S>,
) -> Result<Object<S>> {
    let created = store.create(object.to_stored()?).await?;
    Object::from_stored(created)
}
