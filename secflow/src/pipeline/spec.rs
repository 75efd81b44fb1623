//! Pipeline and stage specifications.

use crate::core::FailurePolicy;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use std::sync::Arc;
use std::time::Duration;

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// How a failure affects the run.
    pub policy: FailurePolicy,
    /// Optional per-stage timeout.
    pub timeout: Option<Duration>,
}

impl StageSpec {
    /// Creates an abort-on-failure stage specification without a timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            policy: FailurePolicy::AbortOnFailure,
            timeout: None,
        }
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Marks the stage best-effort.
    #[must_use]
    pub fn best_effort(self) -> Self {
        self.with_policy(FailurePolicy::BestEffort)
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the timeout is zero.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Stage name cannot be empty or whitespace-only",
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has a zero timeout",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        Ok(())
    }
}

/// A validated, ordered list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageSpec>,
}

impl Pipeline {
    pub(crate) fn new(name: String, stages: Vec<StageSpec>) -> Self {
        Self { name, stages }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in ordinal order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Returns the stage names in ordinal order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStage;

    #[test]
    fn test_stage_spec_creation() {
        let runner = Arc::new(MockStage::new("scan"));
        let spec = StageSpec::new("scan", runner)
            .best_effort()
            .with_timeout(Duration::from_secs(5));

        assert_eq!(spec.name, "scan");
        assert_eq!(spec.policy, FailurePolicy::BestEffort);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_stage_spec_defaults_to_abort() {
        let spec = StageSpec::new("build", Arc::new(MockStage::new("build")));
        assert_eq!(spec.policy, FailurePolicy::AbortOnFailure);
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn test_stage_spec_invalid() {
        let runner = Arc::new(MockStage::new("x"));
        assert!(StageSpec::new("  ", runner.clone()).validate().is_err());
        assert!(StageSpec::new("x", runner)
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
