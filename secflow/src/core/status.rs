//! Stage status, failure policy and run outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stage failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failure stops the run (build, package, quality gate).
    #[default]
    AbortOnFailure,
    /// A failure is recorded and the run continues (dynamic scan, uploads).
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AbortOnFailure => write!(f, "abort_on_failure"),
            Self::BestEffort => write!(f, "best_effort"),
        }
    }
}

/// The execution status of a stage.
///
/// `Pending -> Running -> {Succeeded, FailedFatal, FailedIgnored, TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not dispatched yet (or never, after an abort).
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed and stopped the run.
    FailedFatal,
    /// Failed under a best-effort policy.
    FailedIgnored,
    /// Exceeded the stage timeout or the run budget.
    TimedOut,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedFatal => write!(f, "failed_fatal"),
            Self::FailedIgnored => write!(f, "failed_ignored"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedFatal | Self::FailedIgnored | Self::TimedOut
        )
    }

    /// Returns true if the stage was dispatched at all.
    #[must_use]
    pub fn was_dispatched(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if the status indicates failure of any kind.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedFatal | Self::FailedIgnored | Self::TimedOut)
    }
}

/// The overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every abort-on-failure stage succeeded.
    Success,
    /// A stage crashed instead of reporting an outcome.
    Failed,
    /// A fatal stage failure, timeout or cancellation stopped the run.
    Aborted,
}

impl RunOutcome {
    /// Process exit code reported by the CLI for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Aborted => 2,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}
