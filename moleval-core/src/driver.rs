//! Evaluation driver: turns "a checkpoint exists" into "a metrics artifact
//! exists", exactly once per checkpoint.
//!
//! Checkpoints are processed strictly one after another. A model is resident
//! on the device only between load and the end of sampling; it is released
//! and device memory reclaimed before scoring starts, and memory is reclaimed
//! again once scoring finishes.

use crate::artifact::{ArtifactStore, EvaluationProvenance, MetricsArtifact};
use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::collaborators::{DeviceMemory, ModelLoader, Scorer, ScoringRequest};
use crate::config::MolevalConfig;
use crate::dataset::ReferenceDataset;
use crate::device::Device;
use crate::error::EvalError;
use crate::lease::ModelLease;
use crate::sampling::{SamplingPlan, draw_sample};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What the batch run does when a checkpoint fails for a reason other than
/// an existing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the batch and return the error.
    #[default]
    Abort,
    /// Log the error, record it and move to the next checkpoint.
    Continue,
}

/// Per-process driver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub device: Device,
    pub n_jobs: usize,
    pub plan: SamplingPlan,
    pub failure_policy: FailurePolicy,
}

impl DriverSettings {
    pub fn from_config(config: &MolevalConfig) -> Self {
        Self {
            device: config.device,
            n_jobs: config.n_jobs,
            plan: config.sampling,
            failure_policy: config.failure_policy,
        }
    }
}

/// Result of a single evaluation that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// A new artifact was written.
    Evaluated {
        path: PathBuf,
        sample_size: usize,
        duration: Duration,
    },
    /// The artifact was already present; nothing was done.
    AlreadyExists { path: PathBuf },
}

/// A checkpoint that failed under `FailurePolicy::Continue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointFailure {
    pub id: CheckpointId,
    pub error: String,
}

/// Summary of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub evaluated: Vec<CheckpointId>,
    pub skipped: Vec<CheckpointId>,
    pub failures: Vec<CheckpointFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.evaluated.len() + self.skipped.len() + self.failures.len()
    }
}

pub struct EvaluationDriver {
    settings: DriverSettings,
    reference: Arc<ReferenceDataset>,
    loader: Arc<dyn ModelLoader>,
    scorer: Arc<dyn Scorer>,
    memory: Arc<dyn DeviceMemory>,
    store: ArtifactStore,
}

impl EvaluationDriver {
    pub fn new(
        settings: DriverSettings,
        reference: Arc<ReferenceDataset>,
        loader: Arc<dyn ModelLoader>,
        scorer: Arc<dyn Scorer>,
        memory: Arc<dyn DeviceMemory>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            settings,
            reference,
            loader,
            scorer,
            memory,
            store,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Evaluate one checkpoint.
    ///
    /// Returns `EvalOutcome::AlreadyExists` without loading, sampling or
    /// scoring when the artifact is present and `overwrite` is false. Model
    /// load, sampling and scoring failures are returned as errors.
    pub async fn evaluate(
        &self,
        checkpoint: &Checkpoint,
        overwrite: bool,
    ) -> Result<EvalOutcome, EvalError> {
        let path = self.store.path_for(&checkpoint.id);
        if !overwrite && path.exists() {
            return Ok(EvalOutcome::AlreadyExists { path });
        }
        self.settings.plan.validate()?;

        let started = Instant::now();
        let device = self.settings.device;
        info!(checkpoint = %checkpoint.id, %device, "Evaluating checkpoint");

        let generated = self.sample_checkpoint(checkpoint).await?;

        let scored = self
            .scorer
            .score(ScoringRequest {
                generated: &generated,
                reference: &self.reference,
                device_index: device.accelerator_index(),
                n_jobs: self.settings.n_jobs,
            })
            .await;
        drop(generated);
        let reclaimed = self.memory.reclaim(device).await;
        let metrics = scored?;
        reclaimed?;

        let duration = started.elapsed();
        let plan = self.settings.plan;
        let artifact = MetricsArtifact {
            model_name: checkpoint.id.model_name.clone(),
            checkpoint_index: checkpoint.id.index,
            metrics,
            provenance: EvaluationProvenance {
                checkpoint_path: checkpoint.path.clone(),
                device,
                n_jobs: self.settings.n_jobs,
                seed: plan.seed,
                batch_size: plan.batch_size,
                n_batches: plan.n_batches,
                sample_size: plan.total(),
                reference_fingerprint: self.reference.fingerprint().to_string(),
                evaluated_at: Utc::now(),
                duration_secs: duration.as_secs_f64(),
            },
        };

        let path = match self.store.write(&artifact, overwrite) {
            Ok(path) => path,
            // Another process finished the same checkpoint first.
            Err(EvalError::AlreadyExists { path }) => {
                warn!(checkpoint = %checkpoint.id, "Artifact appeared during evaluation, keeping existing file");
                return Ok(EvalOutcome::AlreadyExists { path });
            }
            Err(e) => return Err(e),
        };

        info!(
            checkpoint = %checkpoint.id,
            path = %path.display(),
            secs = duration.as_secs_f64(),
            "Wrote metrics"
        );
        Ok(EvalOutcome::Evaluated {
            path,
            sample_size: plan.total(),
            duration,
        })
    }

    /// Load, seed, sample, then release and reclaim regardless of outcome.
    async fn sample_checkpoint(&self, checkpoint: &Checkpoint) -> Result<Vec<String>, EvalError> {
        let device = self.settings.device;
        let mut lease = ModelLease::acquire(self.loader.as_ref(), &checkpoint.path, device).await?;

        let sampled = draw_sample(lease.model_mut(), &self.settings.plan).await;
        let released = lease.release().await;
        let reclaimed = self.memory.reclaim(device).await;

        let generated = sampled?;
        released?;
        reclaimed?;
        Ok(generated)
    }

    /// Evaluate every checkpoint in order without overwriting.
    ///
    /// Existing artifacts are skipped. Other failures stop the batch under
    /// `FailurePolicy::Abort` and are recorded under `FailurePolicy::Continue`.
    pub async fn run_batch(&self, checkpoints: &[Checkpoint]) -> Result<BatchReport, EvalError> {
        let mut report = BatchReport::default();
        info!(count = checkpoints.len(), "Starting batch evaluation");

        for checkpoint in checkpoints {
            match self.evaluate(checkpoint, false).await {
                Ok(EvalOutcome::Evaluated { .. }) => report.evaluated.push(checkpoint.id.clone()),
                Ok(EvalOutcome::AlreadyExists { .. }) => {
                    info!(checkpoint = %checkpoint.id, "Metrics already exist, skipping");
                    report.skipped.push(checkpoint.id.clone());
                }
                Err(e) => match self.settings.failure_policy {
                    FailurePolicy::Abort => {
                        error!(checkpoint = %checkpoint.id, error = %e, "Evaluation failed, aborting batch");
                        return Err(e);
                    }
                    FailurePolicy::Continue => {
                        error!(checkpoint = %checkpoint.id, error = %e, "Evaluation failed, continuing");
                        report.failures.push(CheckpointFailure {
                            id: checkpoint.id.clone(),
                            error: e.to_string(),
                        });
                    }
                },
            }
        }

        info!(
            evaluated = report.evaluated.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Batch evaluation finished"
        );
        Ok(report)
    }
}
