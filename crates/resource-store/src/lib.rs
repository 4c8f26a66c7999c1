//! Resource-Store: the declarative record store behind Carton
//!
//! This crate defines the contract Carton uses to read and write declarative
//! resource records. Each record has a `spec` (desired) and `status`
//! (observed) section and lives under a `(kind, namespace, name)` key.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: optimistic concurrency, change notification and retry semantics.
//!
//! ## Key Components
//!
//! - `ResourceStore`: async get/list/create/update/patch/delete/watch contract
//! - `MemoryResourceStore`: in-memory implementation with fault injection
//! - `retry`: transient-error retry and read-modify-write helpers

mod error;
pub mod memory;
pub mod retry;
pub mod storage_traits;

pub use error::StorageError;
pub use memory::MemoryResourceStore;
pub use retry::{retry_transient, update_object_with, update_status_with, RetryPolicy};
pub use storage_traits::{
    ObjectKey, ObjectMeta, ResourceStore, Selector, StorageResult, StoredObject, WatchEvent,
    WatchEventType, WatchStream,
};
