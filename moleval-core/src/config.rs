//! Configuration for moleval.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit config file -> environment. CLI flags are
//! applied by the caller on top of the extracted value.

use crate::device::Device;
use crate::driver::FailurePolicy;
use crate::sampling::SamplingPlan;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MolevalConfig {
    /// Device models are reconstructed onto.
    #[serde(default)]
    pub device: Device,
    /// Parallelism degree forwarded to the scorer.
    #[serde(default = "default_n_jobs")]
    pub n_jobs: usize,
    /// What the batch run does with a failed checkpoint.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Where checkpoints are read from and metrics are written to.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Reference dataset files.
    #[serde(default)]
    pub dataset: DatasetConfig,
    /// Sample size and seed.
    #[serde(default)]
    pub sampling: SamplingPlan,
    /// Python worker configuration.
    #[serde(default)]
    pub python: PythonConfig,
}

impl Default for MolevalConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            n_jobs: default_n_jobs(),
            failure_policy: FailurePolicy::default(),
            paths: PathsConfig::default(),
            dataset: DatasetConfig::default(),
            sampling: SamplingPlan::default(),
            python: PythonConfig::default(),
        }
    }
}

fn default_n_jobs() -> usize {
    8
}

/// Checkpoint and metrics locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root holding one directory per model name.
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: PathBuf,
    /// Root metrics artifacts are written under.
    #[serde(default = "default_metrics_dir")]
    pub metrics_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints_dir: default_checkpoints_dir(),
            metrics_dir: default_metrics_dir(),
        }
    }
}

fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_metrics_dir() -> PathBuf {
    PathBuf::from("metrics")
}

/// Reference dataset file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_test_path")]
    pub test: PathBuf,
    #[serde(default = "default_test_scaffolds_path")]
    pub test_scaffolds: PathBuf,
    #[serde(default = "default_train_path")]
    pub train: PathBuf,
    /// Precomputed statistics of the test set (opaque).
    #[serde(default = "default_test_stats_path")]
    pub test_stats: PathBuf,
    /// Precomputed statistics of the scaffold test set (opaque).
    #[serde(default = "default_test_scaffold_stats_path")]
    pub test_scaffold_stats: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            test: default_test_path(),
            test_scaffolds: default_test_scaffolds_path(),
            train: default_train_path(),
            test_stats: default_test_stats_path(),
            test_scaffold_stats: default_test_scaffold_stats_path(),
        }
    }
}

fn default_test_path() -> PathBuf {
    PathBuf::from("data/test.csv.gz")
}

fn default_test_scaffolds_path() -> PathBuf {
    PathBuf::from("data/test_scaffolds.csv.gz")
}

fn default_train_path() -> PathBuf {
    PathBuf::from("data/train.csv.gz")
}

fn default_test_stats_path() -> PathBuf {
    PathBuf::from("data/test_stats.npz")
}

fn default_test_scaffold_stats_path() -> PathBuf {
    PathBuf::from("data/test_scaffolds_stats.npz")
}

/// Python worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonConfig {
    /// Path to Python executable (auto-detected if not set).
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    /// Path to virtual environment.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// `module:function` called as `factory(path, device)` to rebuild a model.
    #[serde(default = "default_model_factory")]
    pub model_factory: String,
    /// Per-request timeout in seconds (0 = wait indefinitely).
    #[serde(default)]
    pub request_timeout_secs: u64,
    /// Packages `doctor` checks for.
    #[serde(default = "default_required_packages")]
    pub required_packages: Vec<String>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            venv_path: None,
            model_factory: default_model_factory(),
            request_timeout_secs: 0,
            required_packages: default_required_packages(),
        }
    }
}

fn default_model_factory() -> String {
    "models:load_model".to_string()
}

fn default_required_packages() -> Vec<String> {
    vec!["torch".to_string(), "moses".to_string()]
}

impl MolevalConfig {
    /// Resolve every relative path against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.checkpoints_dir);
        resolve(&mut self.paths.metrics_dir);
        resolve(&mut self.dataset.test);
        resolve(&mut self.dataset.test_scaffolds);
        resolve(&mut self.dataset.train);
        resolve(&mut self.dataset.test_stats);
        resolve(&mut self.dataset.test_scaffold_stats);
        if let Some(venv) = self.python.venv_path.as_mut() {
            resolve(venv);
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".moleval").join("config.toml")
}

/// Load configuration with layered merging.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<MolevalConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(MolevalConfig::default()));

    // User-level config
    if let Some(dirs) = directories::ProjectDirs::from("dev", "moleval", "moleval") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (MOLEVAL_DEVICE, MOLEVAL_SAMPLING__SEED, etc.)
    figment = figment.merge(Env::prefixed("MOLEVAL_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = MolevalConfig::default();
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.n_jobs, 8);
        assert_eq!(config.sampling.total(), 30_000);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.paths.metrics_dir, PathBuf::from("metrics"));
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
device = "cuda:1"
n_jobs = 2
failure_policy = "continue"

[sampling]
batch_size = 10
n_batches = 3
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.device, Device::Cuda(1));
        assert_eq!(config.n_jobs, 2);
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.sampling.total(), 30);
        assert_eq!(config.sampling.seed, 0);
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = MolevalConfig::default();
        config.paths.metrics_dir = PathBuf::from("/abs/metrics");
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.paths.checkpoints_dir, PathBuf::from("/work/checkpoints"));
        assert_eq!(config.paths.metrics_dir, PathBuf::from("/abs/metrics"));
        assert_eq!(config.dataset.train, PathBuf::from("/work/data/train.csv.gz"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = MolevalConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed: MolevalConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.python.model_factory, config.python.model_factory);
        assert_eq!(parsed.sampling.n_batches, config.sampling.n_batches);
    }
}
