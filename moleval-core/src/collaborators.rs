//! Seams to the external model runtime and metrics library.
//!
//! The driver only ever talks to these traits. `crate::python` implements
//! them on top of a Python worker; `crate::mock` implements them in-process
//! for tests and dry runs.

use crate::dataset::ReferenceDataset;
use crate::device::Device;
use crate::error::EvalError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Metric name -> scalar or structured value.
pub type MetricsMap = BTreeMap<String, serde_json::Value>;

/// Reconstructs a model from a checkpoint file.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        checkpoint: &Path,
        device: Device,
    ) -> Result<Box<dyn GenerativeModel>, EvalError>;
}

/// A model resident on some device.
#[async_trait]
pub trait GenerativeModel: Send {
    /// Reset the runtime's global random state.
    async fn set_seed(&mut self, seed: u64) -> Result<(), EvalError>;

    /// Draw `n` molecules with gradient tracking disabled.
    async fn sample(&mut self, n: usize) -> Result<Vec<String>, EvalError>;

    /// Move the model off the accelerator, drop it and clear cached memory.
    async fn release(&mut self) -> Result<(), EvalError>;

    /// Best-effort synchronous teardown used when a lease is dropped
    /// without `release`. Must not block.
    fn abandon(&mut self);
}

/// Everything the scorer receives for one checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct ScoringRequest<'a> {
    pub generated: &'a [String],
    pub reference: &'a ReferenceDataset,
    /// Accelerator ordinal, `None` for CPU.
    pub device_index: Option<u32>,
    pub n_jobs: usize,
}

/// Computes all metrics for a generated sample.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, request: ScoringRequest<'_>) -> Result<MetricsMap, EvalError>;
}

/// Returns cached accelerator memory to the device.
#[async_trait]
pub trait DeviceMemory: Send + Sync {
    async fn reclaim(&self, device: Device) -> Result<(), EvalError>;
}
