//! Stages that run an external tool.

use super::Stage;
use crate::context::StageContext;
use crate::core::{ScanArtifact, ScanType, StageOutput};
use crate::tools::{ToolInvocation, ToolRunner, DEFAULT_TOOL_TIMEOUT};
use async_trait::async_trait;
use regex::{Captures, Regex};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PLACEHOLDER_PATTERN: &str = r"\{([a-z_]+)\}";

/// Expands `{revision}`, `{build_number}`, `{workspace}` and `{scratch}`.
///
/// Unknown placeholders are left as written.
#[must_use]
pub fn expand_placeholders(template: &str, ctx: &StageContext) -> String {
    let Ok(pattern) = Regex::new(PLACEHOLDER_PATTERN) else {
        return template.to_string();
    };
    let identity = ctx.identity();
    pattern
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "revision" => identity.revision.clone(),
            "build_number" => identity.build_number.to_string(),
            "workspace" => ctx.run().workspace().display().to_string(),
            "scratch" => ctx.run().scratch_dir().display().to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Runs one external tool and classifies its exit status.
///
/// Exit code zero (or one of the accepted codes) is success. Captured
/// output is redacted and written to the stage log. A declared report file
/// becomes a scan artifact for later upload stages.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    secret_env: Vec<(String, String)>,
    accepted_exit_codes: Vec<i32>,
    artifact: Option<(ScanType, String)>,
    timeout: Duration,
    runner: Arc<dyn ToolRunner>,
}

impl CommandStage {
    /// Creates a command stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            secret_env: Vec::new(),
            accepted_exit_codes: Vec::new(),
            artifact: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
            runner,
        }
    }

    /// Sets the argument templates.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a plain environment variable (template).
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Exposes the named secret to the tool as environment variable `var`.
    #[must_use]
    pub fn with_secret_env(mut self, var: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secret_env.push((var.into(), secret.into()));
        self
    }

    /// Treats these non-zero exit codes as success.
    #[must_use]
    pub fn accept_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = codes;
        self
    }

    /// Declares the report file the tool writes (template).
    #[must_use]
    pub fn with_artifact(mut self, scan_type: ScanType, path: impl Into<String>) -> Self {
        self.artifact = Some((scan_type, path.into()));
        self
    }

    /// Sets the tool timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn write_log(&self, ctx: &StageContext, content: &str) -> Option<PathBuf> {
        let path = ctx.log_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(stage = %self.name, error = %e, "Could not create log directory");
                return None;
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(stage = %self.name, error = %e, "Could not write stage log");
                None
            }
        }
    }
}

fn resolve(workspace: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let broker = ctx.run().credentials();
        let secret_names: Vec<&str> = self.secret_env.iter().map(|(_, s)| s.as_str()).collect();
        let scope = match broker.scope(&secret_names) {
            Ok(scope) => scope,
            Err(e) => return StageOutput::fail(e.to_string()),
        };

        let mut invocation = ToolInvocation::new(expand_placeholders(&self.program, ctx))
            .args(self.args.iter().map(|a| expand_placeholders(a, ctx)))
            .cwd(ctx.run().workspace())
            .timeout(self.timeout);
        for (key, value) in &self.env {
            invocation = invocation.env(key, expand_placeholders(value, ctx));
        }
        for (var, secret) in &self.secret_env {
            if let Some(credential) = scope.get(secret) {
                invocation =
                    invocation.secret_env(var, SecretString::from(credential.expose().to_string()));
            }
        }

        debug!(stage = %self.name, command = %invocation.display_command(), "Running stage command");
        let result = self.runner.run(&invocation).await;
        drop(scope);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = broker.redact(&e.to_string());
                let output_ref = self.write_log(ctx, &message).await;
                let output = StageOutput::fail(message);
                return match output_ref {
                    Some(path) => output.with_output_ref(path),
                    None => output,
                };
            }
        };

        let log = broker.redact(&outcome.combined_output());
        let output_ref = self.write_log(ctx, &log).await;

        let mut output = if outcome.succeeded_with(&self.accepted_exit_codes) {
            StageOutput::ok()
        } else {
            StageOutput::fail(format!(
                "'{}' exited with {}",
                invocation.display_command(),
                outcome
                    .exit_code
                    .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
            ))
        };
        output = output
            .with_data("command", serde_json::json!(invocation.display_command()))
            .with_data("exit_code", serde_json::json!(outcome.exit_code))
            .with_data(
                "duration_ms",
                serde_json::json!(outcome.duration.as_millis() as u64),
            );
        if let Some(path) = output_ref {
            output = output.with_output_ref(path);
        }

        if !output.is_success() {
            return output;
        }

        if let Some((scan_type, template)) = &self.artifact {
            let path = resolve(ctx.run().workspace(), &expand_placeholders(template, ctx));
            if tokio::fs::metadata(&path).await.is_err() {
                let mut failed =
                    StageOutput::fail(format!("expected report {} was not produced", path.display()));
                failed.data = output.data;
                failed.output_ref = output.output_ref;
                return failed;
            }
            output = output.with_artifact(ScanArtifact::file(*scan_type, path).produced_by(&self.name));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputStatus;
    use crate::errors::ToolError;
    use crate::testing::{ScriptedToolRunner, TestRun};
    use crate::tools::ToolOutcome;

    #[test]
    fn test_expand_placeholders() {
        let ctx = TestRun::new()
            .with_workspace("/work")
            .with_identity("deadbeef", 12)
            .stage_context("build");
        assert_eq!(
            expand_placeholders("app:{build_number}-{revision} in {workspace}", &ctx),
            "app:12-deadbeef in /work"
        );
        assert_eq!(expand_placeholders("{scratch}", &ctx), "/work/runs/12");
        assert_eq!(expand_placeholders("{unknown}", &ctx), "{unknown}");
    }

    #[tokio::test]
    async fn test_success_writes_redacted_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("mvn", ToolOutcome::exited(0, "token=s3cr3t-tok BUILD SUCCESS", ""));
        let ctx = TestRun::new()
            .with_workspace(dir.path())
            .with_secret("registry-token", "s3cr3t-tok")
            .stage_context("build");

        let stage = CommandStage::new("build", "mvn", runner.clone())
            .with_args(["package", "-Drevision={revision}"])
            .with_secret_env("REGISTRY_TOKEN", "registry-token");
        let output = stage.execute(&ctx).await;

        assert_eq!(output.status, OutputStatus::Ok);
        let log_path = output.output_ref.clone().unwrap();
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("BUILD SUCCESS"));
        assert!(!log.contains("s3cr3t-tok"));
        assert_eq!(runner.calls(), vec!["mvn package -Drevision=abc123"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("zap", ToolOutcome::exited(2, "", "alerts found"));
        let ctx = TestRun::new().with_workspace(dir.path()).stage_context("dast");

        let output = CommandStage::new("dast", "zap", runner).execute(&ctx).await;
        assert_eq!(output.status, OutputStatus::Fail);
        assert!(output.error.unwrap().contains("code 2"));
        assert_eq!(output.data["exit_code"], 2);
    }

    #[tokio::test]
    async fn test_accepted_exit_code_with_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("trivy-1.json"), b"{}").unwrap();
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("trivy", ToolOutcome::exited(1, "2 HIGH", ""));
        let ctx = TestRun::new()
            .with_workspace(dir.path())
            .with_identity("abc", 1)
            .stage_context("image-scan");

        let output = CommandStage::new("image-scan", "trivy", runner)
            .accept_exit_codes(vec![1])
            .with_artifact(ScanType::DependencyScan, "trivy-{build_number}.json")
            .execute(&ctx)
            .await;

        assert_eq!(output.status, OutputStatus::Ok);
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].file_name(), "trivy-1.json");
        assert_eq!(output.artifacts[0].produced_by.as_deref(), Some("image-scan"));
    }

    #[tokio::test]
    async fn test_missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new());
        let ctx = TestRun::new().with_workspace(dir.path()).stage_context("image-scan");

        let output = CommandStage::new("image-scan", "trivy", runner)
            .with_artifact(ScanType::DependencyScan, "missing.json")
            .execute(&ctx)
            .await;
        assert_eq!(output.status, OutputStatus::Fail);
        assert!(output.error.unwrap().contains("was not produced"));
    }

    #[tokio::test]
    async fn test_unknown_secret_fails_before_running() {
        let runner = Arc::new(ScriptedToolRunner::new());
        let ctx = TestRun::new().stage_context("deploy");

        let output = CommandStage::new("deploy", "kubectl", runner.clone())
            .with_secret_env("KUBE_TOKEN", "kube-token")
            .execute(&ctx)
            .await;
        assert_eq!(output.status, OutputStatus::Fail);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_error_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.fail(
            "missing-tool",
            ToolError::Spawn {
                program: "missing-tool".to_string(),
                reason: "not found".to_string(),
            },
        );
        let ctx = TestRun::new().with_workspace(dir.path()).stage_context("build");

        let output = CommandStage::new("build", "missing-tool", runner).execute(&ctx).await;
        assert_eq!(output.status, OutputStatus::Fail);
        assert!(output.output_ref.is_some());
    }
}
