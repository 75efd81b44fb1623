//! Pipeline run and stage result records.

use super::{FailurePolicy, RunOutcome, StageStatus};
use crate::cleanup::CleanupReport;
use crate::context::RunIdentity;
use crate::errors::StageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Runtime record of one stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Ordinal position in the pipeline.
    pub ordinal: usize,
    /// Declared failure policy.
    pub policy: FailurePolicy,
    /// Current status.
    pub status: StageStatus,
    /// When the stage started running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Captured tool output reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<PathBuf>,
    /// Error attached to a failed stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// Structured data reported by the stage.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageResult {
    /// Creates a pending stage result.
    #[must_use]
    pub fn pending(name: impl Into<String>, ordinal: usize, policy: FailurePolicy) -> Self {
        Self {
            name: name.into(),
            ordinal,
            policy,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            output_ref: None,
            error: None,
            data: HashMap::new(),
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, status: StageStatus, error: Option<StageError>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }

    /// Returns the duration in milliseconds, if the stage ran.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// One execution of a pipeline.
///
/// The outcome is decided once; after cleanup the run is sealed and the
/// record no longer changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    identity: RunIdentity,
    pipeline: String,
    stages: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<RunOutcome>,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleanup: Option<CleanupReport>,
}

impl PipelineRun {
    /// Creates a run with every stage pending.
    #[must_use]
    pub fn new(identity: RunIdentity, pipeline: impl Into<String>, stages: Vec<StageResult>) -> Self {
        Self {
            identity,
            pipeline: pipeline.into(),
            stages,
            outcome: None,
            started_at: Utc::now(),
            ended_at: None,
            cleanup: None,
        }
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the ordered stage results.
    #[must_use]
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Looks up a stage result by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the decided outcome, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    /// Returns the cleanup report once the run is sealed.
    #[must_use]
    pub fn cleanup(&self) -> Option<&CleanupReport> {
        self.cleanup.as_ref()
    }

    /// Returns true once cleanup has run and the record is final.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Returns when the run was sealed.
    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Names of stages that were dispatched, in order.
    #[must_use]
    pub fn executed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status.was_dispatched())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub(crate) fn stage_mut(&mut self, ordinal: usize) -> Option<&mut StageResult> {
        if self.is_sealed() {
            return None;
        }
        self.stages.get_mut(ordinal)
    }

    /// Records the outcome; the first decision wins.
    pub(crate) fn decide(&mut self, outcome: RunOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    pub(crate) fn seal(&mut self, cleanup: CleanupReport) {
        if self.is_sealed() {
            return;
        }
        self.cleanup = Some(cleanup);
        self.ended_at = Some(Utc::now());
    }

    /// Serialises the run report as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> PipelineRun {
        PipelineRun::new(
            RunIdentity::new("abc123", 7),
            "standard",
            vec![
                StageResult::pending("build", 0, FailurePolicy::AbortOnFailure),
                StageResult::pending("dast", 1, FailurePolicy::BestEffort),
            ],
        )
    }

    #[test]
    fn test_stage_result_lifecycle() {
        let mut result = StageResult::pending("build", 0, FailurePolicy::AbortOnFailure);
        assert_eq!(result.status, StageStatus::Pending);
        assert!(result.duration_ms().is_none());

        result.start();
        assert_eq!(result.status, StageStatus::Running);

        result.finish(StageStatus::Succeeded, None);
        assert!(result.status.is_terminal());
        assert!(result.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_outcome_first_decision_wins() {
        let mut run = sample_run();
        run.decide(RunOutcome::Aborted);
        run.decide(RunOutcome::Success);
        assert_eq!(run.outcome(), Some(RunOutcome::Aborted));
    }

    #[test]
    fn test_sealed_run_is_immutable() {
        let mut run = sample_run();
        run.decide(RunOutcome::Success);
        run.seal(CleanupReport::new(run.identity().run_id));

        assert!(run.is_sealed());
        assert!(run.stage_mut(0).is_none());
    }

    #[test]
    fn test_executed_stages() {
        let mut run = sample_run();
        run.stage_mut(0).unwrap().start();
        run.stage_mut(0).unwrap().finish(StageStatus::FailedFatal, None);

        assert_eq!(run.executed_stages(), vec!["build"]);
    }

    #[test]
    fn test_run_report_json() {
        let run = sample_run();
        let json: serde_json::Value = serde_json::from_str(&run.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["pipeline"], "standard");
        assert_eq!(json["stages"][1]["policy"], "best_effort");
        assert_eq!(json["identity"]["build_number"], 7);
    }
}
