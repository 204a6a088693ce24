//! Subprocess execution for version probes and package-manager commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use super::abort::AbortSignal;
use crate::error::ExecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands on behalf of the engine and of definitions.
///
/// A non-zero exit is *not* an error at this level; callers inspect
/// [`ExecOutput::exit_code`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, req: &ExecRequest, signal: &AbortSignal) -> Result<ExecOutput, ExecError>;
}

/// Executor backed by `tokio::process`. Children are killed when aborted or
/// timed out.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn exec(&self, req: &ExecRequest, signal: &AbortSignal) -> Result<ExecOutput, ExecError> {
        let program = req.program.display().to_string();
        if signal.is_aborted() {
            return Err(ExecError::Aborted { program });
        }

        crate::ui::debug("pkg_manager.exec", &format!("Running {}", req.display()));

        let mut cmd = TokioCommand::new(&req.program);
        cmd.args(&req.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        let run = async {
            let output = match req.timeout {
                Some(after) => tokio::time::timeout(after, cmd.output())
                    .await
                    .map_err(|_| ExecError::TimedOut {
                        program: program.clone(),
                        after,
                    })?,
                None => cmd.output().await,
            };
            output.map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })
        };

        let output = tokio::select! {
            biased;
            _ = signal.aborted() => {
                return Err(ExecError::Aborted {
                    program: program.clone(),
                });
            }
            res = run => res?,
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg_manager::abort::AbortController;

    #[test]
    fn test_request_builder() {
        let req = ExecRequest::new("npm")
            .args(["pack", "--json"])
            .arg("--pack-destination")
            .cwd("/tmp")
            .env("CI", "1")
            .timeout(Duration::from_secs(5));
        assert_eq!(req.display(), "npm pack --json --pack-destination");
        assert_eq!(req.cwd.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(req.env, vec![("CI".to_string(), "1".to_string())]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor_captures_output() {
        let req = ExecRequest::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let out = SystemExecutor.exec(&req, &AbortSignal::never()).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor_timeout() {
        let req = ExecRequest::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(50));
        let err = SystemExecutor.exec(&req, &AbortSignal::never()).await.unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let req = ExecRequest::new("sh").args(["-c", "sleep 5"]);

        let task = tokio::spawn(async move { SystemExecutor.exec(&req, &signal).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.abort();

        let res = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("abort should end the command promptly")
            .unwrap();
        assert!(matches!(res, Err(ExecError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let req = ExecRequest::new("/definitely/not/a/real/binary");
        let err = SystemExecutor.exec(&req, &AbortSignal::never()).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
