//! Carton Core Library
//!
//! Package model, version resolution, pipeline synthesis and the ambient
//! pieces (configuration, tracing, lifecycle events) shared by the pipeline
//! executor and the controller.

pub mod config;
pub mod documents;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod resolver;
pub mod synth;
pub mod telemetry;
pub mod values;

pub use config::{parse_duration, ControllerConfig};
pub use documents::{Documents, DEFAULT_NAMESPACE};
pub use domain::*;
pub use metrics::METRICS;
pub use resolver::{select_version, Constraint, VersionCache, VersionResolver};
pub use synth::{synthesize_app, synthesize_install};
pub use telemetry::init_tracing;
pub use values::{deep_merge, export_documents, load_value_documents, merge_documents, ValueDocument};
