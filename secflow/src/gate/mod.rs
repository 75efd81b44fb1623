//! Quality-gate verdicts.
//!
//! The analysis engine computes its verdict asynchronously. Verdicts reach
//! the orchestrator through a [`VerdictChannel`], either posted out of band
//! or by an [`AnalysisServerPoller`] following this run's analysis task on
//! an [`AnalysisServer`], and the [`QualityGateEvaluator`] turns a bounded
//! wait on that channel into a [`GateVerdict`].

mod channel;
mod evaluator;
mod poller;
mod server;

pub use channel::VerdictChannel;
pub use evaluator::QualityGateEvaluator;
pub use poller::AnalysisServerPoller;
pub use server::{
    parse_project_status, parse_report_task, parse_task, read_report_task, AnalysisServer,
    AnalysisTask, HttpAnalysisServer, ReportTask, TaskStatus,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final verdict computed by the analysis engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisVerdict {
    /// Quality gate passed.
    Passed,
    /// Quality gate failed.
    Failed,
}

impl fmt::Display for AnalysisVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of waiting on the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    /// Verdict arrived and passed.
    Passed,
    /// Verdict arrived and failed.
    Failed,
    /// No verdict arrived in time.
    TimedOut,
}

impl GateVerdict {
    /// Only `Passed` lets a run continue.
    #[must_use]
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl From<AnalysisVerdict> for GateVerdict {
    fn from(verdict: AnalysisVerdict) -> Self {
        match verdict {
            AnalysisVerdict::Passed => Self::Passed,
            AnalysisVerdict::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}
