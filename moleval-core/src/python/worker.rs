//! Long-lived Python worker process.
//!
//! Started lazily on first request, killed on drop, restarted on the next
//! request after a crash, timeout or `kill()`. Reference datasets registered
//! with a process are tracked so each is shipped once per process.

use crate::error::EvalError;
use crate::python::protocol::{Request, Response};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Source of the worker, run with `python -u -c`.
pub const WORKER_SCRIPT: &str = include_str!("worker.py");

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    registered: HashSet<String>,
}

pub struct PythonWorker {
    python: PathBuf,
    workspace: PathBuf,
    timeout: Option<Duration>,
    process: Option<WorkerProcess>,
}

impl PythonWorker {
    /// `timeout` bounds each request; `None` waits indefinitely.
    pub fn new(python: PathBuf, workspace: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            python,
            workspace,
            timeout,
            process: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn is_registered(&self, fingerprint: &str) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.registered.contains(fingerprint))
    }

    pub fn mark_registered(&mut self, fingerprint: &str) {
        if let Some(process) = self.process.as_mut() {
            process.registered.insert(fingerprint.to_string());
        }
    }

    fn spawn(&self) -> Result<WorkerProcess, EvalError> {
        let mut child = Command::new(&self.python)
            .args(["-u", "-c", WORKER_SCRIPT])
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EvalError::python(format!(
                    "failed to spawn '{}': {e}",
                    self.python.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvalError::python("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvalError::python("worker stdout unavailable"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "moleval::python", "{line}");
                }
            });
        }

        info!(pid = child.id(), python = %self.python.display(), "Started Python worker");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            registered: HashSet::new(),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// Errors reported by the worker come back as `EvalError::Python`. A
    /// transport failure, timeout or unparseable reply kills the process.
    pub async fn call(&mut self, request: &Request<'_>) -> Result<serde_json::Value, EvalError> {
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let line = serde_json::to_string(request)?;
        let op = request.op();
        debug!(op, bytes = line.len(), "Python request");

        let timeout = self.timeout;
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| EvalError::python("worker not running"))?;
        let exchange = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.write_all(b"\n").await?;
            process.stdin.flush().await?;

            let mut reply = String::new();
            let read = process.stdout.read_line(&mut reply).await?;
            if read == 0 {
                return Err(EvalError::python("worker exited unexpectedly"));
            }
            Ok::<_, EvalError>(reply)
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(inner) => inner,
                Err(_) => Err(EvalError::Timeout(format!(
                    "Python op '{op}' timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => exchange.await,
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!(op, error = %e, "Python worker transport failed, killing worker");
                self.kill();
                return Err(e);
            }
        };

        let response: Response = match serde_json::from_str(reply.trim()) {
            Ok(response) => response,
            Err(e) => {
                // The stream is out of step; the real reply may still be buffered.
                warn!(op, error = %e, "Unparseable Python response, killing worker");
                self.kill();
                return Err(EvalError::python(format!("invalid response to '{op}': {e}")));
            }
        };
        response.into_result().map_err(EvalError::Python)
    }

    /// Kill the process without waiting. Safe to call from synchronous code.
    pub fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.start_kill() {
                warn!(error = %e, "Failed to kill Python worker");
            } else {
                info!(pid = process.child.id(), "Killed Python worker");
            }
        }
    }

    /// Ask the worker to exit, then reap it.
    pub async fn shutdown(&mut self) -> Result<(), EvalError> {
        if self.process.is_none() {
            return Ok(());
        }
        let result = self.call(&Request::Shutdown).await;
        if let Some(mut process) = self.process.take() {
            drop(process.stdin);
            let _ = process.child.wait().await;
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_script_handles_every_op() {
        for op in [
            "load",
            "seed",
            "sample",
            "release",
            "reclaim",
            "register_reference",
            "score",
            "shutdown",
        ] {
            assert!(
                WORKER_SCRIPT.contains(&format!("\"{op}\"")),
                "worker script does not handle '{op}'"
            );
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_python_error() {
        let mut worker = PythonWorker::new(
            PathBuf::from("/nonexistent/python-for-moleval"),
            std::env::temp_dir(),
            None,
        );
        let err = worker.call(&Request::Seed { value: 1 }).await.unwrap_err();
        assert!(matches!(err, EvalError::Python(_)));
        assert!(!worker.is_running());
        assert!(!worker.is_registered("anything"));
    }

    /// An executable that stands in for the interpreter and ignores its args.
    #[cfg(unix)]
    fn fake_interpreter(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-python");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unparseable_reply_kills_worker() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(
            dir.path(),
            r#"echo "native library banner"
echo '{"ok": true, "result": null}'
cat > /dev/null"#,
        );
        let mut worker = PythonWorker::new(python, dir.path().to_path_buf(), None);

        let err = worker.call(&Request::Seed { value: 1 }).await.unwrap_err();
        assert!(matches!(err, EvalError::Python(ref m) if m.contains("invalid response")));
        assert!(!worker.is_running(), "a desynchronised stream must not be reused");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_interpreter(dir.path(), "exec sleep 30");
        let mut worker = PythonWorker::new(
            python,
            dir.path().to_path_buf(),
            Some(Duration::from_millis(200)),
        );

        let err = worker.call(&Request::Seed { value: 1 }).await.unwrap_err();
        assert!(matches!(err, EvalError::Timeout(_)));
        assert!(!worker.is_running());
    }
}
