//! Supporting service environments.
//!
//! An environment is a named set of long-lived containers (analysis server,
//! databases) declared by an [`EnvironmentSpec`]. Every resource is
//! classified [`Retention::Persistent`] or [`Retention::Transient`]; the
//! [`EnvironmentLifecycleManager`] reconciles declared against observed
//! state and never prunes persistent resources unless an operator asks for
//! [`PruneScope::All`]. [`EnvironmentLeases`] serialise runs that target the
//! same environment.

mod lease;
mod lifecycle;
mod runtime;
mod spec;

pub use lease::{EnvironmentLease, EnvironmentLeases};
pub use lifecycle::{
    Environment, EnvironmentLifecycleManager, PlannedStep, PruneReport, PruneScope,
    ReconcileAction, ReconcilePlan,
};
pub use runtime::{parse_inspect, ContainerRuntime, ContainerState, DockerCli};
pub use spec::{
    validate_resource_name, EnvironmentSpec, RestartPolicy, Retention, ServiceSpec,
    ENVIRONMENT_LABEL, RETENTION_LABEL,
};
