//! Value-source resolution, merging and export.
//!
//! Each source yields one or more raw YAML documents:
//! - `inline`: the mapping itself
//! - `secretRef` / `configMapRef`: one document per data entry, in key
//!   order, or only the entry named by `key`
//!
//! Documents merge in declaration order; mappings merge recursively and
//! any other value is replaced, so the last source wins.

use std::collections::BTreeMap;

use resource_store::{retry_transient, ObjectKey, ResourceStore, RetryPolicy};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::error::{CartonError, Result};
use crate::domain::install::{ConfigMapSpec, DataRef, SecretSpec, ValueSource};
use crate::domain::resource::{Object, ResourceSpec};

/// One raw YAML document and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDocument {
    pub origin: String,
    pub content: String,
}

/// Read every source into raw documents, preserving declaration order.
pub async fn load_value_documents(
    store: &dyn ResourceStore,
    namespace: &str,
    sources: &[ValueSource],
    retry: &RetryPolicy,
) -> Result<Vec<ValueDocument>> {
    let mut documents = Vec::new();
    for source in sources {
        match source {
            ValueSource::Inline(value) => documents.push(ValueDocument {
                origin: "inline".to_string(),
                content: serde_yaml::to_string(value)?,
            }),
            ValueSource::SecretRef(data_ref) => {
                let data = read_data::<SecretSpec>(store, namespace, &data_ref.name, retry, |s| s.data).await?;
                documents.extend(select_entries(SecretSpec::KIND, data_ref, data)?);
            }
            ValueSource::ConfigMapRef(data_ref) => {
                let data =
                    read_data::<ConfigMapSpec>(store, namespace, &data_ref.name, retry, |c| c.data).await?;
                documents.extend(select_entries(ConfigMapSpec::KIND, data_ref, data)?);
            }
        }
    }
    Ok(documents)
}

async fn read_data<S: ResourceSpec>(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    retry: &RetryPolicy,
    data: impl FnOnce(S) -> BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let key = ObjectKey::new(S::KIND, namespace, name);
    match retry_transient(retry, "get-values", || store.get(&key)).await {
        Ok(object) => Ok(data(Object::<S>::from_stored(object)?.spec)),
        Err(err) if err.is_not_found() => Err(CartonError::not_found(
            S::KIND,
            format!("{namespace}/{name}"),
        )),
        Err(err) => Err(err.into()),
    }
}

fn select_entries(
    kind: &str,
    data_ref: &DataRef,
    data: BTreeMap<String, String>,
) -> Result<Vec<ValueDocument>> {
    let origin = |entry: &str| format!("{}/{}:{entry}", kind.to_lowercase(), data_ref.name);
    match &data_ref.key {
        Some(key) => {
            let content = data.get(key).cloned().ok_or_else(|| {
                CartonError::not_found(format!("{kind} key"), format!("{}:{key}", data_ref.name))
            })?;
            Ok(vec![ValueDocument {
                origin: origin(key),
                content,
            }])
        }
        None => Ok(data
            .into_iter()
            .map(|(entry, content)| ValueDocument {
                origin: origin(&entry),
                content,
            })
            .collect()),
    }
}

/// Merge documents into one mapping; later documents win.
pub fn merge_documents(documents: &[ValueDocument]) -> Result<Value> {
    let mut merged = Value::Object(serde_json::Map::new());
    for document in documents {
        for part in serde_yaml::Deserializer::from_str(&document.content) {
            let value = Value::deserialize(part).map_err(|e| {
                CartonError::InvalidSpec(format!("values from {}: {e}", document.origin))
            })?;
            if value.is_null() {
                continue;
            }
            if !value.is_object() {
                return Err(CartonError::InvalidSpec(format!(
                    "values from {} must be a mapping",
                    document.origin
                )));
            }
            deep_merge(&mut merged, value);
        }
    }
    Ok(merged)
}

/// Merge `overlay` into `base`: mappings recursively, everything else replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Concatenate raw documents into one multi-document YAML stream.
///
/// Each document is prefixed with `---` unless it already starts with one.
pub fn export_documents(documents: &[ValueDocument]) -> String {
    let mut out = String::new();
    for document in documents {
        if !document.content.trim_start().starts_with("---") {
            out.push_str("---\n");
        }
        out.push_str(&document.content);
        if !document.content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
