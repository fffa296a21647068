//! In-process collaborators for tests and dry runs.
//!
//! `MockModel` emits SMILES-like strings from a seeded RNG, so sampling is
//! reproducible exactly like a real runtime after a global seed reset.
//! Every collaborator appends to a shared `EventLog` so tests can assert
//! ordering (e.g. release strictly before scoring).

use crate::collaborators::{
    DeviceMemory, GenerativeModel, MetricsMap, ModelLoader, Scorer, ScoringRequest,
};
use crate::device::Device;
use crate::error::EvalError;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const FRAGMENTS: &[&str] = &[
    "C", "CC", "O", "N", "c1ccccc1", "Cl", "F", "C(=O)", "S", "C#N", "OC", "[nH]",
];

/// Metric keys the mock scorer reports.
pub const MOCK_METRIC_KEYS: &[&str] = &["Novelty", "unique@1000", "unique@10000", "valid"];

/// Something a collaborator did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Load,
    Seed(u64),
    Sample(usize),
    Release,
    Abandon,
    Reclaim(Device),
    Score {
        generated: usize,
        device_index: Option<u32>,
    },
}

/// Shared, ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// A model whose "weights" are a single integer.
pub struct MockModel {
    weights: u64,
    rng: StdRng,
    short_batches: bool,
    fail_sampling: bool,
    fail_release: bool,
    log: Option<EventLog>,
}

impl MockModel {
    pub fn new(weights: u64) -> Self {
        Self {
            weights,
            rng: StdRng::seed_from_u64(weights),
            short_batches: false,
            fail_sampling: false,
            fail_release: false,
            log: None,
        }
    }

    /// Return one molecule fewer than requested.
    pub fn with_short_batches(mut self) -> Self {
        self.short_batches = true;
        self
    }

    fn record(&self, event: Event) {
        if let Some(log) = &self.log {
            log.push(event);
        }
    }

    fn molecule(&mut self) -> String {
        let pieces = self.rng.gen_range(1..=6);
        (0..pieces)
            .map(|_| FRAGMENTS[self.rng.gen_range(0..FRAGMENTS.len())])
            .collect()
    }
}

#[async_trait]
impl GenerativeModel for MockModel {
    async fn set_seed(&mut self, seed: u64) -> Result<(), EvalError> {
        self.record(Event::Seed(seed));
        self.rng = StdRng::seed_from_u64(seed ^ self.weights.rotate_left(32));
        Ok(())
    }

    async fn sample(&mut self, n: usize) -> Result<Vec<String>, EvalError> {
        self.record(Event::Sample(n));
        if self.fail_sampling {
            return Err(EvalError::sampling("mock sampler failure"));
        }
        let n = if self.short_batches { n.saturating_sub(1) } else { n };
        Ok((0..n).map(|_| self.molecule()).collect())
    }

    async fn release(&mut self) -> Result<(), EvalError> {
        self.record(Event::Release);
        if self.fail_release {
            return Err(EvalError::python("mock release failure"));
        }
        Ok(())
    }

    fn abandon(&mut self) {
        self.record(Event::Abandon);
    }
}

/// Loads `MockModel`s whose weights derive from the checkpoint path.
#[derive(Debug, Clone, Default)]
pub struct MockModelLoader {
    log: EventLog,
    fail_load_for: Vec<String>,
    fail_sampling: bool,
    fail_release: bool,
}

impl MockModelLoader {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Fail loading any checkpoint whose path contains `fragment`.
    pub fn failing_load_for(mut self, fragment: impl Into<String>) -> Self {
        self.fail_load_for.push(fragment.into());
        self
    }

    pub fn failing_sampling(mut self) -> Self {
        self.fail_sampling = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }
}

#[async_trait]
impl ModelLoader for MockModelLoader {
    async fn load(
        &self,
        checkpoint: &Path,
        _device: Device,
    ) -> Result<Box<dyn GenerativeModel>, EvalError> {
        let display = checkpoint.display().to_string();
        if self.fail_load_for.iter().any(|f| display.contains(f.as_str())) {
            return Err(EvalError::model_load(format!("mock cannot load '{display}'")));
        }
        self.log.push(Event::Load);

        let weights = display
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
        let mut model = MockModel::new(weights);
        model.fail_sampling = self.fail_sampling;
        model.fail_release = self.fail_release;
        model.log = Some(self.log.clone());
        Ok(Box::new(model))
    }
}

/// Scores samples with simple set statistics.
#[derive(Debug, Clone, Default)]
pub struct MockScorer {
    log: EventLog,
    fail: bool,
}

impl MockScorer {
    pub fn new(log: EventLog) -> Self {
        Self { log, fail: false }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

fn unique_fraction(sample: &[String], k: usize) -> f64 {
    let head = &sample[..sample.len().min(k)];
    if head.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&String> = head.iter().collect();
    unique.len() as f64 / head.len() as f64
}

#[async_trait]
impl Scorer for MockScorer {
    async fn score(&self, request: ScoringRequest<'_>) -> Result<MetricsMap, EvalError> {
        self.log.push(Event::Score {
            generated: request.generated.len(),
            device_index: request.device_index,
        });
        if self.fail {
            return Err(EvalError::scoring("mock scorer failure"));
        }

        let generated = request.generated;
        let valid = generated.iter().filter(|s| !s.is_empty()).count();
        let train: HashSet<&String> = request.reference.train.iter().collect();
        let unique: HashSet<&String> = generated.iter().collect();
        let novel = unique.iter().filter(|s| !train.contains(*s)).count();

        let mut metrics = MetricsMap::new();
        metrics.insert(
            "valid".to_string(),
            json!(valid as f64 / generated.len().max(1) as f64),
        );
        metrics.insert("unique@1000".to_string(), json!(unique_fraction(generated, 1000)));
        metrics.insert("unique@10000".to_string(), json!(unique_fraction(generated, 10_000)));
        metrics.insert(
            "Novelty".to_string(),
            json!(novel as f64 / unique.len().max(1) as f64),
        );
        Ok(metrics)
    }
}

/// Device memory that records every reclaim.
#[derive(Debug, Clone, Default)]
pub struct RecordingMemory {
    log: EventLog,
}

impl RecordingMemory {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl DeviceMemory for RecordingMemory {
    async fn reclaim(&self, device: Device) -> Result<(), EvalError> {
        self.log.push(Event::Reclaim(device));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ReferenceDataset, StatsBundle};

    #[tokio::test]
    async fn test_same_seed_same_molecules() {
        let mut a = MockModel::new(5);
        let mut b = MockModel::new(5);
        a.set_seed(1).await.unwrap();
        b.set_seed(1).await.unwrap();
        assert_eq!(a.sample(50).await.unwrap(), b.sample(50).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_weights_differ() {
        let mut a = MockModel::new(5);
        let mut b = MockModel::new(6);
        a.set_seed(1).await.unwrap();
        b.set_seed(1).await.unwrap();
        assert_ne!(a.sample(50).await.unwrap(), b.sample(50).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_scorer_keys() {
        let reference = ReferenceDataset::from_parts(
            vec!["CC".into()],
            vec!["c1ccccc1".into()],
            vec!["CC".into()],
            StatsBundle::from_bytes("a", vec![1]),
            StatsBundle::from_bytes("b", vec![2]),
        );
        let generated: Vec<String> = vec!["CC".into(), "CO".into(), "CO".into(), "N".into()];
        let scorer = MockScorer::new(EventLog::new());
        let metrics = scorer
            .score(ScoringRequest {
                generated: &generated,
                reference: &reference,
                device_index: None,
                n_jobs: 1,
            })
            .await
            .unwrap();

        let keys: Vec<&str> = metrics.keys().map(String::as_str).collect();
        assert_eq!(keys, MOCK_METRIC_KEYS);
        assert_eq!(metrics["valid"], json!(1.0));
        assert_eq!(metrics["unique@1000"], json!(0.75));
        // CO and N are novel, CC is in train
        assert_eq!(metrics["Novelty"], json!(2.0 / 3.0));
    }
}
