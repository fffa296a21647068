//! Python interpreter discovery.

use crate::config::PythonConfig;
use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Resolves which interpreter runs the worker.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
}

impl PythonRuntime {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
        }
    }

    pub fn from_config(config: &PythonConfig, workspace: &Path) -> Self {
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path: config.venv_path.clone().or_else(detect_venv),
            workspace: workspace.to_path_buf(),
        }
    }

    /// Effective Python command (accounting for venv).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Report the interpreter `python_cmd` resolves to.
    pub async fn detect(&self) -> Result<PythonInfo, EvalError> {
        let cmd = self.python_cmd();
        let output = Command::new(&cmd)
            .arg("--version")
            .output()
            .await
            .map_err(|e| EvalError::python(format!("cannot run '{}': {e}", cmd.display())))?;

        if !output.status.success() {
            return Err(EvalError::python(format!(
                "'{} --version' exited with {}",
                cmd.display(),
                output.status
            )));
        }

        // Python 2 and some builds print the version on stderr.
        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        debug!(python = %cmd.display(), %version, "Detected Python");

        Ok(PythonInfo {
            path: cmd,
            version,
            venv_path: self.venv_path.clone(),
        })
    }

    /// Check which packages are importable.
    pub async fn check_packages(&self, packages: &[String]) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for pkg in packages {
            let script = format!("import importlib; importlib.import_module('{pkg}')");
            let available = Command::new(self.python_cmd())
                .args(["-c", &script])
                .current_dir(&self.workspace)
                .output()
                .await
                .is_ok_and(|o| o.status.success());

            results.insert(pkg.clone(), available);
        }

        results
    }
}

/// Detect a virtual environment in common locations.
fn detect_venv() -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }

    [".venv", "venv"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join("pyvenv.cfg").exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_cmd_prefers_venv() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/usr/bin/python3.11")),
            venv_path: Some(PathBuf::from("/work/.venv")),
            ..Default::default()
        };
        let runtime = PythonRuntime::from_config(&config, Path::new("/work"));
        let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
        assert_eq!(
            runtime.python_cmd(),
            PathBuf::from("/work/.venv").join(bin_dir).join("python")
        );
    }

    #[test]
    fn test_python_cmd_default() {
        let runtime = PythonRuntime::new(PathBuf::from("/work"));
        assert_eq!(runtime.python_cmd(), PathBuf::from("python3"));
    }

    #[tokio::test]
    async fn test_detect_does_not_panic() {
        // Python may or may not be available in CI.
        let runtime = PythonRuntime::new(std::env::temp_dir());
        if let Ok(info) = runtime.detect().await {
            assert!(!info.version.is_empty());
        }
    }
}
