//! Pipeline builder with validation.

use super::{Pipeline, StageSpec};
use crate::core::FailurePolicy;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Stages run in the order they are added.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
    names: HashSet<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid or its name is taken.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        runner: Arc<dyn Stage>,
        policy: FailurePolicy,
    ) -> Result<Self, PipelineValidationError> {
        self.add_stage_spec(StageSpec::new(name, runner).with_policy(policy))?;
        Ok(self)
    }

    /// Appends a stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid or its name is taken.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if !self.names.insert(spec.name.clone()) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage name '{}'",
                spec.name
            ))
            .with_stages(vec![spec.name]));
        }

        self.stages.push(spec);
        Ok(())
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline name is blank or there are no stages.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages"));
        }

        Ok(Pipeline::new(self.name, self.stages))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStage;

    fn noop(name: &str) -> Arc<dyn Stage> {
        Arc::new(MockStage::new(name))
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_preserves_order() {
        let pipeline = PipelineBuilder::new("test")
            .stage("build", noop("build"), FailurePolicy::AbortOnFailure)
            .unwrap()
            .stage("scan", noop("scan"), FailurePolicy::BestEffort)
            .unwrap()
            .stage("deploy", noop("deploy"), FailurePolicy::AbortOnFailure)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "test");
        assert_eq!(pipeline.stage_names(), vec!["build", "scan", "deploy"]);
        assert_eq!(pipeline.stages()[1].policy, FailurePolicy::BestEffort);
    }

    #[test]
    fn test_builder_duplicate_name() {
        let err = PipelineBuilder::new("test")
            .stage("build", noop("build"), FailurePolicy::AbortOnFailure)
            .unwrap()
            .stage("build", noop("build"), FailurePolicy::BestEffort)
            .unwrap_err();

        assert!(err.message.contains("Duplicate"));
        assert_eq!(err.stages, vec!["build".to_string()]);
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert!(err.message.contains("no stages"));
    }

    #[test]
    fn test_builder_blank_pipeline_name() {
        let result = PipelineBuilder::new("  ")
            .stage("build", noop("build"), FailurePolicy::AbortOnFailure)
            .unwrap()
            .build();
        assert!(result.is_err());
    }
}
