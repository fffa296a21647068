//! Batched, seed-reproducible sampling from a loaded model.

use crate::collaborators::GenerativeModel;
use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many molecules to draw and with which seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingPlan {
    /// Molecules requested per call to the model's sampler.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of sampler calls.
    #[serde(default = "default_n_batches")]
    pub n_batches: usize,
    /// Seed applied once before the first batch.
    #[serde(default)]
    pub seed: u64,
}

impl Default for SamplingPlan {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            n_batches: default_n_batches(),
            seed: 0,
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_n_batches() -> usize {
    300
}

impl SamplingPlan {
    pub fn new(batch_size: usize, n_batches: usize, seed: u64) -> Self {
        Self {
            batch_size,
            n_batches,
            seed,
        }
    }

    /// Total sample size, `batch_size * n_batches`.
    pub fn total(&self) -> usize {
        self.batch_size * self.n_batches
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.batch_size == 0 || self.n_batches == 0 {
            return Err(EvalError::invalid_input(format!(
                "sampling plan must draw at least one molecule (batch_size={}, n_batches={})",
                self.batch_size, self.n_batches
            )));
        }
        if self.batch_size.checked_mul(self.n_batches).is_none() {
            return Err(EvalError::invalid_input(format!(
                "sampling plan is too large (batch_size={}, n_batches={})",
                self.batch_size, self.n_batches
            )));
        }
        Ok(())
    }
}

/// Seed the model, then draw `plan.n_batches` batches of `plan.batch_size`.
///
/// Returns one flat sequence in draw order. A batch of the wrong length is a
/// sampling error.
pub async fn draw_sample(
    model: &mut dyn GenerativeModel,
    plan: &SamplingPlan,
) -> Result<Vec<String>, EvalError> {
    plan.validate()?;
    model.set_seed(plan.seed).await?;

    let mut sample = Vec::with_capacity(plan.total());
    for batch in 0..plan.n_batches {
        let drawn = model.sample(plan.batch_size).await?;
        if drawn.len() != plan.batch_size {
            return Err(EvalError::sampling(format!(
                "batch {batch} returned {} molecules, expected {}",
                drawn.len(),
                plan.batch_size
            )));
        }
        sample.extend(drawn);
        debug!(batch, drawn = sample.len(), "Sampled batch");
    }

    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockModel;

    #[test]
    fn test_total() {
        assert_eq!(SamplingPlan::default().total(), 30_000);
        assert_eq!(SamplingPlan::new(7, 13, 1).total(), 91);
    }

    #[test]
    fn test_validate_rejects_empty_plan() {
        assert!(SamplingPlan::new(0, 10, 0).validate().is_err());
        assert!(SamplingPlan::new(10, 0, 0).validate().is_err());
        assert!(SamplingPlan::new(1, 1, 0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_overflowing_plan() {
        let err = SamplingPlan::new(usize::MAX, 2, 0).validate().unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));
        assert!(SamplingPlan::new(usize::MAX, 1, 0).validate().is_ok());
    }

    #[tokio::test]
    async fn test_draw_sample_size_and_reproducibility() {
        let plan = SamplingPlan::new(7, 13, 42);

        let mut first = MockModel::new(11);
        let a = draw_sample(&mut first, &plan).await.unwrap();
        assert_eq!(a.len(), 91);

        let mut second = MockModel::new(11);
        let b = draw_sample(&mut second, &plan).await.unwrap();
        assert_eq!(a, b);

        let mut reseeded = MockModel::new(11);
        let c = draw_sample(&mut reseeded, &SamplingPlan::new(7, 13, 43))
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_short_batch_is_sampling_error() {
        let mut model = MockModel::new(1).with_short_batches();
        let err = draw_sample(&mut model, &SamplingPlan::new(5, 2, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Sampling(_)));
    }
}
