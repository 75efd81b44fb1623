//! Idempotent reconciliation and scoped pruning of environments.

use super::lease::EnvironmentLeases;
use super::runtime::{ContainerRuntime, ContainerState};
use super::spec::{EnvironmentSpec, Retention, ServiceSpec};
use crate::context::RunIdentity;
use crate::errors::EnvironmentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What reconciliation does to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Running, healthy and as declared.
    None,
    /// Absent; create and start it.
    Create,
    /// Present but stopped; start it.
    Start,
    /// Restart policy drifted; correct it in place.
    UpdateRestartPolicy,
    /// Transient resource drifted; remove and create it again.
    Recreate,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Create => write!(f, "create"),
            Self::Start => write!(f, "start"),
            Self::UpdateRestartPolicy => write!(f, "update_restart_policy"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}

/// One planned action on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Service name.
    pub service: String,
    /// Action to take.
    pub action: ReconcileAction,
}

/// Declared-versus-observed comparison for an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    /// Environment name.
    pub environment: String,
    /// Steps in application order.
    pub steps: Vec<PlannedStep>,
    /// Drift that is reported but deliberately left alone.
    pub warnings: Vec<String>,
}

impl ReconcilePlan {
    /// True if applying the plan changes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.action == ReconcileAction::None)
    }

    /// Returns the actions planned for a service.
    #[must_use]
    pub fn actions_for(&self, service: &str) -> Vec<ReconcileAction> {
        self.steps
            .iter()
            .filter(|s| s.service == service)
            .map(|s| s.action)
            .collect()
    }

    fn push(&mut self, service: &str, action: ReconcileAction) {
        self.steps.push(PlannedStep {
            service: service.to_string(),
            action,
        });
    }
}

/// A reconciled environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name.
    pub name: String,
    /// Shared network, if any.
    pub network: Option<String>,
    /// Service names with their retention class.
    pub resources: Vec<(String, Retention)>,
    /// The plan that was applied.
    pub plan: ReconcilePlan,
}

/// How much a prune may remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneScope {
    /// Only resources labelled transient. The only scope a run uses.
    TransientOnly,
    /// Everything in the environment, persistent state included.
    All,
}

impl fmt::Display for PruneScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientOnly => write!(f, "transient_only"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Outcome of a prune pass. Failures never abort the pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Removed resource names.
    pub removed: Vec<String>,
    /// Resources left in place.
    pub kept: Vec<String>,
    /// `(resource, error)` pairs for removals that failed.
    pub failures: Vec<(String, String)>,
}

impl PruneReport {
    /// True if every attempted removal succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Brings environments to their declared state and reclaims transient
/// resources.
#[derive(Debug, Clone)]
pub struct EnvironmentLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl EnvironmentLifecycleManager {
    /// Creates a manager over a container runtime.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Returns the runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Compares declared and observed state without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec is invalid, the runtime cannot be
    /// queried, or a declared-persistent service is labelled transient.
    pub async fn plan(&self, spec: &EnvironmentSpec) -> Result<ReconcilePlan, EnvironmentError> {
        spec.validate()?;

        let mut plan = ReconcilePlan {
            environment: spec.name.clone(),
            ..ReconcilePlan::default()
        };

        for service in &spec.services {
            let observed = self.runtime.inspect(&service.name).await?;
            plan_service(&mut plan, &spec.name, service, observed.as_ref())?;
        }

        Ok(plan)
    }

    /// Brings the environment to its declared state.
    ///
    /// Running, healthy resources that match the declaration are left
    /// untouched, so a second call with an unchanged spec does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first runtime failure.
    pub async fn reconcile(&self, spec: &EnvironmentSpec) -> Result<Environment, EnvironmentError> {
        spec.validate()?;
        if let Some(network) = &spec.network {
            if self.runtime.ensure_network(&spec.name, network).await? {
                info!(environment = %spec.name, network = %network, "Created network");
            }
        }

        let plan = self.plan(spec).await?;
        for warning in &plan.warnings {
            warn!(environment = %spec.name, "{}", warning);
        }

        for step in &plan.steps {
            let Some(service) = spec.service(&step.service) else {
                continue;
            };
            self.apply(spec, service, step.action).await?;
        }

        if plan.is_noop() {
            info!(environment = %spec.name, "Environment already reconciled");
        } else {
            info!(
                environment = %spec.name,
                steps = plan.steps.iter().filter(|s| s.action != ReconcileAction::None).count(),
                "Environment reconciled"
            );
        }

        Ok(Environment {
            name: spec.name.clone(),
            network: spec.network.clone(),
            resources: spec
                .services
                .iter()
                .map(|s| (s.name.clone(), s.retention))
                .collect(),
            plan,
        })
    }

    async fn apply(
        &self,
        spec: &EnvironmentSpec,
        service: &ServiceSpec,
        action: ReconcileAction,
    ) -> Result<(), EnvironmentError> {
        let network = spec.network.as_deref();
        match action {
            ReconcileAction::None => {}
            ReconcileAction::Create => {
                info!(environment = %spec.name, service = %service.name, "Creating service");
                self.runtime.create(&spec.name, network, service).await?;
                self.runtime.start(&service.name).await?;
            }
            ReconcileAction::Start => {
                info!(environment = %spec.name, service = %service.name, "Starting service");
                self.runtime.start(&service.name).await?;
            }
            ReconcileAction::UpdateRestartPolicy => {
                info!(
                    environment = %spec.name,
                    service = %service.name,
                    policy = %service.restart_policy,
                    "Correcting restart policy"
                );
                self.runtime
                    .set_restart_policy(&service.name, service.restart_policy)
                    .await?;
            }
            ReconcileAction::Recreate => {
                if service.retention.is_persistent() {
                    warn!(service = %service.name, "Refusing to recreate persistent service");
                    return Ok(());
                }
                info!(environment = %spec.name, service = %service.name, "Recreating service");
                self.runtime.remove(&service.name).await?;
                self.runtime.create(&spec.name, network, service).await?;
                self.runtime.start(&service.name).await?;
            }
        }
        Ok(())
    }

    /// Removes resources of an environment within the given scope.
    ///
    /// Under [`PruneScope::TransientOnly`] a resource is kept unless it is
    /// positively labelled transient and `spec` does not declare it
    /// persistent. Failures are collected, never raised.
    pub async fn prune(&self, spec: &EnvironmentSpec, scope: PruneScope) -> PruneReport {
        let environment = spec.name.as_str();
        let mut report = PruneReport::default();

        if scope == PruneScope::All {
            warn!(
                environment = %environment,
                "Pruning ALL resources, persistent state included"
            );
        }

        let resources = match self.runtime.list(environment).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(environment = %environment, error = %e, "Could not list resources to prune");
                report.failures.push((environment.to_string(), e.to_string()));
                return report;
            }
        };

        for resource in resources {
            let protected = resource.is_protected() || spec.declares_persistent(&resource.name);
            if scope == PruneScope::TransientOnly && protected {
                report.kept.push(resource.name);
                continue;
            }
            match self.runtime.remove(&resource.name).await {
                Ok(()) => report.removed.push(resource.name),
                Err(e) => {
                    warn!(resource = %resource.name, error = %e, "Prune failed");
                    report.failures.push((resource.name, e.to_string()));
                }
            }
        }

        if let Err(e) = self.runtime.prune_images().await {
            warn!(error = %e, "Image prune failed");
            report.failures.push(("images".to_string(), e.to_string()));
        }

        info!(
            environment = %environment,
            scope = %scope,
            removed = report.removed.len(),
            kept = report.kept.len(),
            failures = report.failures.len(),
            "Prune finished"
        );
        report
    }

    /// Prunes like [`Self::prune`] while holding the environment's lease
    /// as `operator`, so a run in progress is never pruned under.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Conflict`] without touching anything if
    /// the environment is leased.
    pub async fn prune_exclusive(
        &self,
        leases: &EnvironmentLeases,
        operator: &RunIdentity,
        spec: &EnvironmentSpec,
        scope: PruneScope,
    ) -> Result<PruneReport, EnvironmentError> {
        let lease = leases.try_acquire(&spec.name, operator)?;
        let report = self.prune(spec, scope).await;
        drop(lease);
        Ok(report)
    }
}

fn plan_service(
    plan: &mut ReconcilePlan,
    environment: &str,
    service: &ServiceSpec,
    observed: Option<&ContainerState>,
) -> Result<(), EnvironmentError> {
    let Some(state) = observed else {
        plan.push(&service.name, ReconcileAction::Create);
        return Ok(());
    };

    if let Some(owner) = &state.environment {
        if owner != environment {
            plan.warnings.push(format!(
                "service '{}' is labelled for environment '{owner}'",
                service.name
            ));
        }
    }

    if service.retention.is_persistent() && state.retention == Some(Retention::Transient) {
        return Err(EnvironmentError::RetentionMismatch {
            service: service.name.clone(),
        });
    }
    if state.retention != Some(service.retention) {
        plan.warnings.push(format!(
            "service '{}' is declared {} but labelled {}",
            service.name,
            service.retention,
            state.retention.map_or("unlabelled", |r| r.as_str())
        ));
    }

    let drifted = state.image != service.image_ref();
    let unhealthy = state.running && state.healthy == Some(false);

    if service.retention == Retention::Transient && (drifted || unhealthy) {
        plan.push(&service.name, ReconcileAction::Recreate);
        return Ok(());
    }

    if drifted {
        plan.warnings.push(format!(
            "persistent service '{}' runs {} but {} is declared; not recreating",
            service.name,
            state.image,
            service.image_ref()
        ));
    }
    if unhealthy {
        plan.warnings
            .push(format!("persistent service '{}' reports unhealthy", service.name));
    }

    let mut changed = false;
    if state.restart_policy != service.restart_policy {
        plan.push(&service.name, ReconcileAction::UpdateRestartPolicy);
        changed = true;
    }
    if !state.running {
        plan.push(&service.name, ReconcileAction::Start);
        changed = true;
    }
    if !changed {
        plan.push(&service.name, ReconcileAction::None);
    }
    Ok(())
}
