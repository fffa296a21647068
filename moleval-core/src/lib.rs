//! # moleval-core: checkpoint-driven evaluation of generative molecular models
//!
//! For every checkpoint under `<root>/<model>/<prefix>_<index>.<ext>` the
//! driver reconstructs the model, draws a seed-reproducible sample, releases
//! the model from its device, scores the sample against a reference dataset
//! and writes `<metrics>/<model>/<index>.json` exactly once.
//!
//! Model runtime and metric computation are external collaborators behind the
//! traits in [`collaborators`]; [`python`] implements them over a Python
//! worker process and [`mock`] implements them in-process.

pub mod artifact;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod dataset;
pub mod device;
pub mod driver;
pub mod error;
pub mod lease;
pub mod mock;
pub mod persistence;
pub mod python;
pub mod sampling;
pub mod summary;

// Re-exports
pub use artifact::{ArtifactStore, EvaluationProvenance, MetricsArtifact};
pub use checkpoint::{Checkpoint, CheckpointId, discover_checkpoints, parse_checkpoint_index};
pub use collaborators::{DeviceMemory, GenerativeModel, MetricsMap, ModelLoader, Scorer};
pub use config::{MolevalConfig, load_config};
pub use dataset::ReferenceDataset;
pub use device::Device;
pub use driver::{BatchReport, DriverSettings, EvalOutcome, EvaluationDriver, FailurePolicy};
pub use error::EvalError;
pub use lease::ModelLease;
pub use sampling::SamplingPlan;
pub use summary::MetricsTable;
