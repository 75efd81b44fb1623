//! External tool invocation.
//!
//! Build tools, scanners and the container runtime CLI are opaque external
//! processes. A [`ToolRunner`] runs one [`ToolInvocation`] to completion
//! under a timeout and hands back the exit status and captured output.
//! Interpreting the exit status is left to the caller.

use crate::errors::ToolError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default timeout for a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// One external process invocation.
#[derive(Debug)]
pub struct ToolInvocation {
    /// Program to run.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Environment variables carrying secrets.
    pub secret_env: Vec<(String, SecretString)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Upper bound on the invocation's wall time.
    pub timeout: Duration,
}

impl ToolInvocation {
    /// Creates an invocation of `program` with the default timeout.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            secret_env: Vec::new(),
            cwd: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds an environment variable holding a secret.
    #[must_use]
    pub fn secret_env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.secret_env.push((key.into(), value));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders the command line for logs. Secret values are never included.
    #[must_use]
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Result of a finished tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall time of the invocation.
    pub duration: Duration,
}

impl ToolOutcome {
    /// Creates an outcome with the given exit code and output.
    #[must_use]
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// True if the exit code is zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True if the exit code is zero or one of `accepted`.
    #[must_use]
    pub fn succeeded_with(&self, accepted: &[i32]) -> bool {
        match self.exit_code {
            Some(0) => true,
            Some(code) => accepted.contains(&code),
            None => false,
        }
    }

    /// Combined stdout and stderr, as written to stage logs.
    #[must_use]
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 16);
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("--- stderr ---\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs external tools.
#[async_trait]
pub trait ToolRunner: Send + Sync + Debug {
    /// Runs an invocation to completion or timeout.
    ///
    /// A non-zero exit is not an error at this level.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError>;
}

/// Runs tools as child processes of the orchestrator.
///
/// Children are killed if the invocation times out or the calling task is
/// aborted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessToolRunner;

impl ProcessToolRunner {
    /// Creates a process runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        debug!(command = %invocation.display_command(), "Running external tool");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        for (key, value) in &invocation.secret_env {
            cmd.env(key, value.expose_secret());
        }
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| ToolError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::Io {
                    program: invocation.program.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    command = %invocation.display_command(),
                    timeout_ms = invocation.timeout.as_millis() as u64,
                    "External tool timed out"
                );
                return Err(ToolError::Timeout {
                    program: invocation.program.clone(),
                    timeout_ms: invocation.timeout.as_millis() as u64,
                });
            }
        };

        let outcome = ToolOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };

        if !outcome.success() {
            debug!(
                command = %invocation.display_command(),
                exit_code = ?outcome.exit_code,
                "External tool exited non-zero"
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder() {
        let inv = ToolInvocation::new("docker")
            .arg("inspect")
            .args(["--type", "container"])
            .env("DOCKER_HOST", "unix:///var/run/docker.sock")
            .secret_env("TOKEN", SecretString::from("s3cr3t-value".to_string()))
            .timeout(Duration::from_secs(5));

        assert_eq!(inv.display_command(), "docker inspect --type container");
        assert_eq!(inv.timeout, Duration::from_secs(5));
        assert!(!format!("{inv:?}").contains("s3cr3t-value"));
    }

    #[test]
    fn test_outcome_accepted_codes() {
        assert!(ToolOutcome::exited(0, "", "").succeeded_with(&[]));
        assert!(!ToolOutcome::exited(1, "", "").succeeded_with(&[]));
        assert!(ToolOutcome::exited(1, "", "").succeeded_with(&[1]));
        let killed = ToolOutcome {
            exit_code: None,
            ..ToolOutcome::default()
        };
        assert!(!killed.succeeded_with(&[1]));
    }

    #[test]
    fn test_combined_output() {
        let out = ToolOutcome::exited(1, "built", "warning: x");
        assert_eq!(out.combined_output(), "built\n--- stderr ---\nwarning: x");
        assert_eq!(ToolOutcome::exited(0, "only", "").combined_output(), "only");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let outcome = ProcessToolRunner::new()
            .run(&ToolInvocation::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_passes_secret_env() {
        let outcome = ProcessToolRunner::new()
            .run(
                &ToolInvocation::new("sh")
                    .args(["-c", "printf %s \"$API_TOKEN\""])
                    .secret_env("API_TOKEN", SecretString::from("abc123".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "abc123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let err = ProcessToolRunner::new()
            .run(
                &ToolInvocation::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_process_runner_spawn_failure() {
        let err = ProcessToolRunner::new()
            .run(&ToolInvocation::new("secflow-no-such-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
