//! Collaborator implementations backed by a shared Python worker.

use crate::collaborators::{
    DeviceMemory, GenerativeModel, MetricsMap, ModelLoader, Scorer, ScoringRequest,
};
use crate::config::PythonConfig;
use crate::device::Device;
use crate::error::EvalError;
use crate::python::protocol::{LoadResult, Request, SampleResult};
use crate::python::runtime::PythonRuntime;
use crate::python::worker::PythonWorker;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Model loader, scorer and device memory over one worker process.
///
/// Clones share the worker, so the model and the scorer live in the same
/// interpreter and see the same accelerator allocator.
#[derive(Clone)]
pub struct PythonBackend {
    worker: Arc<Mutex<PythonWorker>>,
    factory: String,
}

impl PythonBackend {
    pub fn new(config: &PythonConfig, workspace: &Path) -> Self {
        let runtime = PythonRuntime::from_config(config, workspace);
        let timeout = (config.request_timeout_secs > 0)
            .then(|| Duration::from_secs(config.request_timeout_secs));
        let worker = PythonWorker::new(runtime.python_cmd(), workspace.to_path_buf(), timeout);
        Self {
            worker: Arc::new(Mutex::new(worker)),
            factory: config.model_factory.clone(),
        }
    }

    /// Stop the worker process if it is running.
    pub async fn shutdown(&self) -> Result<(), EvalError> {
        self.worker.lock().await.shutdown().await
    }

    /// Kill the worker, dropping whatever it holds on the device.
    pub async fn kill(&self) {
        self.worker.lock().await.kill();
    }
}

/// Re-tag a worker-reported failure with the phase it happened in.
fn in_phase(err: EvalError, phase: fn(String) -> EvalError) -> EvalError {
    match err {
        EvalError::Python(msg) => phase(msg),
        other => other,
    }
}

#[async_trait]
impl ModelLoader for PythonBackend {
    async fn load(
        &self,
        checkpoint: &Path,
        device: Device,
    ) -> Result<Box<dyn GenerativeModel>, EvalError> {
        let value = self
            .worker
            .lock()
            .await
            .call(&Request::Load {
                path: checkpoint,
                device: device.to_string(),
                factory: &self.factory,
            })
            .await
            .map_err(|e| in_phase(e, EvalError::ModelLoad))?;
        let LoadResult { handle } = serde_json::from_value(value)?;
        debug!(handle, checkpoint = %checkpoint.display(), "Python model loaded");

        Ok(Box::new(PythonModel {
            worker: Arc::clone(&self.worker),
            handle,
        }))
    }
}

/// Handle to a model living inside the worker.
struct PythonModel {
    worker: Arc<Mutex<PythonWorker>>,
    handle: u64,
}

#[async_trait]
impl GenerativeModel for PythonModel {
    async fn set_seed(&mut self, seed: u64) -> Result<(), EvalError> {
        self.worker
            .lock()
            .await
            .call(&Request::Seed { value: seed })
            .await
            .map_err(|e| in_phase(e, EvalError::Sampling))?;
        Ok(())
    }

    async fn sample(&mut self, n: usize) -> Result<Vec<String>, EvalError> {
        let value = self
            .worker
            .lock()
            .await
            .call(&Request::Sample {
                handle: self.handle,
                n,
            })
            .await
            .map_err(|e| in_phase(e, EvalError::Sampling))?;
        let SampleResult { samples } = serde_json::from_value(value)?;
        Ok(samples)
    }

    async fn release(&mut self) -> Result<(), EvalError> {
        let mut worker = self.worker.lock().await;
        // A killed worker took the model with it.
        if !worker.is_running() {
            debug!(handle = self.handle, "Python worker gone, nothing to release");
            return Ok(());
        }
        worker
            .call(&Request::Release {
                handle: self.handle,
            })
            .await?;
        Ok(())
    }

    fn abandon(&mut self) {
        // Killing the interpreter is the only release that cannot be skipped.
        match self.worker.try_lock() {
            Ok(mut worker) => worker.kill(),
            Err(_) => warn!(
                handle = self.handle,
                "Python worker busy, abandoned model stays resident until the worker exits"
            ),
        }
    }
}

#[async_trait]
impl Scorer for PythonBackend {
    async fn score(&self, request: ScoringRequest<'_>) -> Result<MetricsMap, EvalError> {
        let reference = request.reference;
        let fingerprint = reference.fingerprint();
        let mut worker = self.worker.lock().await;

        if !worker.is_registered(fingerprint) {
            info!(fingerprint = %reference.short_fingerprint(), "Registering reference dataset with Python worker");
            worker
                .call(&Request::RegisterReference {
                    fingerprint,
                    test: &reference.test,
                    test_scaffolds: &reference.test_scaffolds,
                    train: &reference.train,
                    test_stats_b64: STANDARD.encode(&reference.test_stats.bytes),
                    test_scaffold_stats_b64: STANDARD.encode(&reference.test_scaffold_stats.bytes),
                })
                .await
                .map_err(|e| in_phase(e, EvalError::Scoring))?;
            worker.mark_registered(fingerprint);
        }

        let value = worker
            .call(&Request::Score {
                fingerprint,
                generated: request.generated,
                device_index: request.device_index,
                n_jobs: request.n_jobs,
            })
            .await
            .map_err(|e| in_phase(e, EvalError::Scoring))?;

        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(EvalError::scoring(format!(
                "scorer returned {other} instead of a metrics mapping"
            ))),
        }
    }
}

#[async_trait]
impl DeviceMemory for PythonBackend {
    async fn reclaim(&self, device: Device) -> Result<(), EvalError> {
        let mut worker = self.worker.lock().await;
        // A worker that is not running holds no device memory.
        if !worker.is_running() {
            return Ok(());
        }
        worker
            .call(&Request::Reclaim {
                device: device.to_string(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ReferenceDataset, StatsBundle};
    use std::path::PathBuf;

    fn broken_backend() -> PythonBackend {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/nonexistent/python-for-moleval")),
            venv_path: Some(PathBuf::from("/nonexistent/venv")),
            ..Default::default()
        };
        PythonBackend::new(&config, &std::env::temp_dir())
    }

    #[test]
    fn test_in_phase_retags_worker_errors() {
        let err = in_phase(EvalError::python("boom"), EvalError::ModelLoad);
        assert!(matches!(err, EvalError::ModelLoad(ref m) if m == "boom"));

        let err = in_phase(EvalError::Timeout("slow".into()), EvalError::Scoring);
        assert!(matches!(err, EvalError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_load_without_interpreter_is_model_load_error() {
        let backend = broken_backend();
        let err = backend
            .load(Path::new("m1/checkpoint_1.pt"), Device::Cpu)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EvalError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_reclaim_without_worker_is_noop() {
        let backend = broken_backend();
        backend.reclaim(Device::Cuda(0)).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_worker_killed_does_not_respawn() {
        let backend = broken_backend();
        let mut model = PythonModel {
            worker: Arc::clone(&backend.worker),
            handle: 1,
        };
        model.release().await.unwrap();
        assert!(!backend.worker.lock().await.is_running());
    }

    const STUB_MODELS: &str = r#"
import os


class Stub:
    def sample(self, n):
        return ["C"] * n


def load_model(path, device):
    if path.endswith("_10.pt"):
        os.write(1, b"native library banner\n")
    return Stub()
"#;

    const STUB_STATS: &str = r#"
COUNT = 0


def bump():
    global COUNT
    COUNT += 1
    return {"mu": COUNT}
"#;

    const STUB_METRICS: &str = r#"
import stubstats


def get_all_metrics(gen, n_jobs, device, test, test_scaffolds, ptest, ptest_scaffolds, train):
    return {"valid": 1.0, "n": len(gen), "device": device, "stats_loads": stubstats.COUNT}
"#;

    /// Stats that count how often the worker unpickles them.
    fn counting_stats() -> StatsBundle {
        StatsBundle::from_bytes("stats.p", b"cstubstats\nbump\n(tR.".to_vec())
    }

    fn reference(test: &[&str]) -> ReferenceDataset {
        ReferenceDataset::from_parts(
            test.iter().map(|s| s.to_string()).collect(),
            vec!["c1ccccc1".into()],
            vec!["CC".into()],
            counting_stats(),
            counting_stats(),
        )
    }

    async fn score(backend: &PythonBackend, reference: &ReferenceDataset) -> MetricsMap {
        backend
            .score(ScoringRequest {
                generated: &["C".to_string(), "CC".to_string()],
                reference,
                device_index: None,
                n_jobs: 1,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_python_bridge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.py"), STUB_MODELS).unwrap();
        std::fs::write(dir.path().join("stubstats.py"), STUB_STATS).unwrap();
        std::fs::create_dir(dir.path().join("moses")).unwrap();
        std::fs::write(dir.path().join("moses/__init__.py"), "").unwrap();
        std::fs::write(dir.path().join("moses/metrics.py"), STUB_METRICS).unwrap();

        let config = PythonConfig {
            python_path: Some(PathBuf::from("python3")),
            model_factory: "models:load_model".into(),
            request_timeout_secs: 60,
            ..Default::default()
        };
        // Python may or may not be available in CI.
        if PythonRuntime::from_config(&config, dir.path())
            .detect()
            .await
            .is_err()
        {
            return;
        }
        let backend = PythonBackend::new(&config, dir.path());

        // The factory writes a banner straight to fd 1 for this checkpoint.
        let mut model = backend
            .load(Path::new("m1/checkpoint_10.pt"), Device::Cpu)
            .await
            .unwrap();
        model.set_seed(7).await.unwrap();
        assert_eq!(model.sample(3).await.unwrap(), vec!["C", "C", "C"]);
        model.release().await.unwrap();

        let first = reference(&["CCO"]);
        let metrics = score(&backend, &first).await;
        assert_eq!(metrics["n"], serde_json::json!(2));
        assert_eq!(metrics["device"], serde_json::json!("cpu"));
        assert_eq!(metrics["stats_loads"], serde_json::json!(2));

        // Registered once per process.
        let metrics = score(&backend, &first).await;
        assert_eq!(metrics["stats_loads"], serde_json::json!(2));
        assert!(backend.worker.lock().await.is_registered(first.fingerprint()));

        // A new process starts with nothing registered.
        backend.kill().await;
        assert!(!backend.worker.lock().await.is_registered(first.fingerprint()));
        let metrics = score(&backend, &first).await;
        assert_eq!(metrics["stats_loads"], serde_json::json!(2));

        let second = reference(&["CCN"]);
        let metrics = score(&backend, &second).await;
        assert_eq!(metrics["stats_loads"], serde_json::json!(4));

        backend.reclaim(Device::Cpu).await.unwrap();
        backend.shutdown().await.unwrap();
        assert!(!backend.worker.lock().await.is_running());
    }
}
