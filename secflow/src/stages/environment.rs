//! Environment acquisition and reconciliation stage.

use super::Stage;
use crate::context::StageContext;
use crate::core::StageOutput;
use crate::environment::{EnvironmentLeases, EnvironmentLifecycleManager, EnvironmentSpec};
use crate::errors::EnvironmentError;
use async_trait::async_trait;
use tracing::{info, warn};

/// Acquires exclusive use of the target environment and reconciles it.
///
/// The lease is parked on the run context, so it is released only after
/// the run's cleanup has finished.
#[derive(Debug, Clone)]
pub struct ReconcileEnvironmentStage {
    name: String,
    manager: EnvironmentLifecycleManager,
    spec: EnvironmentSpec,
    leases: EnvironmentLeases,
}

impl ReconcileEnvironmentStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: EnvironmentLifecycleManager,
        spec: EnvironmentSpec,
        leases: EnvironmentLeases,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            spec,
            leases,
        }
    }
}

#[async_trait]
impl Stage for ReconcileEnvironmentStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let lease = match self.leases.try_acquire(&self.spec.name, ctx.identity()) {
            Ok(lease) => lease,
            Err(EnvironmentError::Conflict {
                environment,
                holder,
            }) => {
                warn!(environment = %environment, holder = %holder, "Environment is in use");
                return StageOutput::conflict(environment, holder);
            }
            Err(e) => return StageOutput::fail(e.to_string()),
        };
        info!(environment = %self.spec.name, "Environment lease acquired");
        ctx.run().held().hold(lease);

        match self.manager.reconcile(&self.spec).await {
            Ok(environment) => StageOutput::ok()
                .with_data("environment", serde_json::json!(environment.name))
                .with_data(
                    "plan",
                    serde_json::to_value(&environment.plan).unwrap_or_default(),
                ),
            Err(e) => StageOutput::fail(e.to_string()),
        }
    }
}
