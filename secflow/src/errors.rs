//! Error types for the secflow orchestrator.
//!
//! Each concern (external tools, the container runtime, the findings tracker,
//! the analysis server, credentials, configuration) has its own error enum.
//! [`StageError`] is the run-level taxonomy attached to stage results.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for secflow operations.
#[derive(Debug, Error)]
pub enum SecflowError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage-level error.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// An external tool invocation failed.
    #[error("{0}")]
    Tool(#[from] ToolError),

    /// Environment reconciliation or pruning failed.
    #[error("{0}")]
    Environment(#[from] EnvironmentError),

    /// The findings tracker rejected or failed a request.
    #[error("{0}")]
    Tracker(#[from] TrackerError),

    /// The analysis server could not be queried.
    #[error("{0}")]
    Gate(#[from] GateError),

    /// A credential could not be resolved.
    #[error("{0}")]
    Credential(#[from] CredentialError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which deadline a timeout refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// The stage's own declared timeout.
    Stage,
    /// The run-level budget bounding all stages.
    Run,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage => write!(f, "stage"),
            Self::Run => write!(f, "run"),
        }
    }
}

/// Error attached to a stage result.
///
/// Only fatal, timeout (outside best-effort stages), conflict, cancellation
/// and crash errors change the run outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    /// Raised by an abort-on-failure stage, or escalated by a best-effort one.
    #[error("Stage '{stage}' failed: {message}")]
    Fatal {
        /// Stage name.
        stage: String,
        /// Failure detail.
        message: String,
    },

    /// Raised by a best-effort stage; recorded but does not stop the run.
    #[error("Stage '{stage}' failed (ignored): {message}")]
    Ignorable {
        /// Stage name.
        stage: String,
        /// Failure detail.
        message: String,
    },

    /// The stage exceeded its own timeout or the run budget.
    #[error("Stage '{stage}' exceeded the {scope} timeout of {timeout_ms}ms")]
    Timeout {
        /// Stage name.
        stage: String,
        /// Which deadline expired.
        scope: TimeoutScope,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The target environment is held by another run.
    #[error("Stage '{stage}' could not acquire environment '{environment}': held by {holder}")]
    ResourceConflict {
        /// Stage name.
        stage: String,
        /// Environment name.
        environment: String,
        /// Description of the current holder.
        holder: String,
    },

    /// The run was cancelled while the stage was active.
    #[error("Stage '{stage}' cancelled: {reason}")]
    Cancelled {
        /// Stage name.
        stage: String,
        /// Cancellation reason.
        reason: String,
    },

    /// The stage's unit of work panicked instead of returning an outcome.
    #[error("Stage '{stage}' crashed: {message}")]
    Crashed {
        /// Stage name.
        stage: String,
        /// Panic or join failure detail.
        message: String,
    },
}

impl StageError {
    /// Returns the name of the stage the error belongs to.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::Fatal { stage, .. }
            | Self::Ignorable { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::ResourceConflict { stage, .. }
            | Self::Cancelled { stage, .. }
            | Self::Crashed { stage, .. } => stage,
        }
    }

    /// Returns true if the error is merely recorded.
    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::Ignorable { .. })
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Errors from invoking external processes.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The process could not be started.
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn {
        /// Program name.
        program: String,
        /// OS error detail.
        reason: String,
    },

    /// The process did not finish within its timeout and was killed.
    #[error("'{program}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Program name.
        program: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Waiting on the process failed.
    #[error("IO error while running '{program}': {reason}")]
    Io {
        /// Program name.
        program: String,
        /// Error detail.
        reason: String,
    },
}

/// Errors from environment reconciliation, pruning and leasing.
#[derive(Debug, Clone, Error)]
pub enum EnvironmentError {
    /// A container runtime command failed.
    #[error("Runtime operation '{operation}' on '{resource}' failed: {message}")]
    Runtime {
        /// Operation name (create, start, remove, ...).
        operation: String,
        /// Resource name.
        resource: String,
        /// Captured error output.
        message: String,
    },

    /// A resource or environment name is not a valid container name.
    #[error("Invalid resource name '{name}'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The environment is exclusively held by another run.
    #[error("Environment '{environment}' is held by {holder}")]
    Conflict {
        /// Environment name.
        environment: String,
        /// Description of the current holder.
        holder: String,
    },

    /// A declared-persistent resource carries a transient label.
    ///
    /// Labels cannot be changed on an existing container, and recreating
    /// it would discard its state, so reconciliation stops instead.
    #[error(
        "Service '{service}' is declared persistent but labelled transient; \
         recreate it manually to relabel"
    )]
    RetentionMismatch {
        /// Service name.
        service: String,
    },

    /// The runtime returned state that could not be parsed.
    #[error("Could not decode runtime state for '{resource}': {message}")]
    Decode {
        /// Resource name.
        resource: String,
        /// Parse error detail.
        message: String,
    },

    /// An external tool failed to run at all.
    #[error("{0}")]
    Tool(#[from] ToolError),
}

impl EnvironmentError {
    /// Creates a runtime error.
    #[must_use]
    pub fn runtime(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Runtime {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Errors from the findings-tracker REST protocol.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// The request could not be sent.
    #[error("Tracker request to {endpoint} failed: {message}")]
    Transport {
        /// Endpoint path.
        endpoint: String,
        /// Transport error detail.
        message: String,
    },

    /// The tracker answered with a non-success status.
    #[error("Tracker returned {status} for {endpoint}: {body}")]
    Status {
        /// Endpoint path.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("Could not decode tracker response from {endpoint}: {message}")]
    Decode {
        /// Endpoint path.
        endpoint: String,
        /// Decode error detail.
        message: String,
    },

    /// An artifact payload could not be read.
    #[error("Could not read scan artifact {path}: {message}")]
    Artifact {
        /// Artifact path.
        path: String,
        /// IO error detail.
        message: String,
    },
}

impl TrackerError {
    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode { .. } | Self::Artifact { .. } => false,
        }
    }
}

/// Errors from polling the analysis server for a gate verdict.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// The request could not be sent.
    #[error("Analysis server request failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("Analysis server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("Could not decode analysis server response: {0}")]
    Decode(String),

    /// The scanner's report-task file is missing or unusable.
    #[error("Analysis report task unavailable: {0}")]
    ReportTask(String),
}

/// Errors from resolving secrets.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// No source knows the secret.
    #[error("Unknown credential '{name}'")]
    Unknown {
        /// Secret name.
        name: String,
    },

    /// The secret resolved to an empty value.
    #[error("Credential '{name}' is empty")]
    Empty {
        /// Secret name.
        name: String,
    },
}

/// Errors from loading and validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Could not read config {path}: {message}")]
    Read {
        /// File path.
        path: String,
        /// IO error detail.
        message: String,
    },

    /// The configuration file is not valid TOML for the schema.
    #[error("Could not parse config: {0}")]
    Parse(String),

    /// The configuration is well-formed but inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Truncates a response body for inclusion in an error message.
#[must_use]
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_stage_name() {
        let err = StageError::Timeout {
            stage: "gate".to_string(),
            scope: TimeoutScope::Stage,
            timeout_ms: 500,
        };
        assert_eq!(err.stage(), "gate");
        assert!(err.to_string().contains("stage timeout of 500ms"));
        assert!(!err.is_ignorable());
    }

    #[test]
    fn test_stage_error_serialize_tagged() {
        let err = StageError::Ignorable {
            stage: "dast".to_string(),
            message: "exit 2".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "ignorable");
        assert_eq!(json["stage"], "dast");
    }

    #[test]
    fn test_tracker_error_transient() {
        let unavailable = TrackerError::Status {
            endpoint: "engagements/".to_string(),
            status: 503,
            body: String::new(),
        };
        let bad_request = TrackerError::Status {
            endpoint: "engagements/".to_string(),
            status: 400,
            body: String::new(),
        };
        assert!(unavailable.is_transient());
        assert!(!bad_request.is_transient());
        assert!(TrackerError::Transport {
            endpoint: "import-scan/".to_string(),
            message: "reset".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(2000);
        let truncated = truncate_body(&long);
        assert!(truncated.len() < 600);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn test_environment_error_from_tool() {
        let err: EnvironmentError = ToolError::Spawn {
            program: "docker".to_string(),
            reason: "not found".to_string(),
        }
        .into();
        assert!(err.to_string().contains("docker"));
    }
}
