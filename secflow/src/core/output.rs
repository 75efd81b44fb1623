//! Stage output type with factory methods.

use super::ScanArtifact;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// What the unit of work reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// The work succeeded.
    Ok,
    /// The work failed; the stage's failure policy decides what happens.
    Fail,
    /// The work failed in a way that must stop the run regardless of policy.
    Fatal,
}

/// The target environment was held by another run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConflict {
    /// Environment name.
    pub environment: String,
    /// Description of the holder.
    pub holder: String,
}

/// The output of a stage execution.
///
/// `StageOutput` is immutable once returned to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: OutputStatus,

    /// Structured data for the run report.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Scan artifacts produced by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ScanArtifact>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set when the failure is an environment collision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ResourceConflict>,

    /// Path of the captured (redacted) tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<PathBuf>,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::ok()
    }
}

impl StageOutput {
    fn with_status(status: OutputStatus, error: Option<String>) -> Self {
        Self {
            status,
            data: HashMap::new(),
            artifacts: Vec::new(),
            error,
            conflict: None,
            output_ref: None,
        }
    }

    /// Creates a successful output with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::with_status(OutputStatus::Ok, None)
    }

    /// Creates a successful output with a single value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self::ok().with_data(key, value)
    }

    /// Creates a failure output; the stage's policy classifies it.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self::with_status(OutputStatus::Fail, Some(error.into()))
    }

    /// Creates a failure that aborts the run even under a best-effort policy.
    #[must_use]
    pub fn fatal(error: impl Into<String>) -> Self {
        Self::with_status(OutputStatus::Fatal, Some(error.into()))
    }

    /// Creates a fatal failure caused by an environment collision.
    #[must_use]
    pub fn conflict(environment: impl Into<String>, holder: impl Into<String>) -> Self {
        let conflict = ResourceConflict {
            environment: environment.into(),
            holder: holder.into(),
        };
        let mut output = Self::fatal(format!(
            "environment '{}' is held by {}",
            conflict.environment, conflict.holder
        ));
        output.conflict = Some(conflict);
        output
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attaches a produced scan artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ScanArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Attaches the captured output reference.
    #[must_use]
    pub fn with_output_ref(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_ref = Some(path.into());
        self
    }

    /// Returns true if the work succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScanType;

    #[test]
    fn test_ok_output() {
        let output = StageOutput::ok_value("image", serde_json::json!("app:42"));
        assert!(output.is_success());
        assert_eq!(output.data.get("image"), Some(&serde_json::json!("app:42")));
        assert!(output.error.is_none());
    }

    #[test]
    fn test_fail_and_fatal() {
        let fail = StageOutput::fail("exit 1");
        assert_eq!(fail.status, OutputStatus::Fail);
        assert_eq!(fail.error.as_deref(), Some("exit 1"));

        let fatal = StageOutput::fatal("no engagement");
        assert_eq!(fatal.status, OutputStatus::Fatal);
        assert!(!fatal.is_success());
    }

    #[test]
    fn test_conflict_output() {
        let output = StageOutput::conflict("staging", "run 1234");
        assert_eq!(output.status, OutputStatus::Fatal);
        let conflict = output.conflict.unwrap();
        assert_eq!(conflict.environment, "staging");
        assert_eq!(conflict.holder, "run 1234");
    }

    #[test]
    fn test_output_with_artifact_and_ref() {
        let output = StageOutput::ok()
            .with_artifact(ScanArtifact::file(ScanType::DependencyScan, "trivy.json"))
            .with_output_ref("/work/logs/7/image-scan.log");
        assert_eq!(output.artifacts.len(), 1);
        assert!(output.output_ref.is_some());
    }

    #[test]
    fn test_output_serialization_skips_empty() {
        let json = serde_json::to_value(StageOutput::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }
}
