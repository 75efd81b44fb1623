//! # Secflow
//!
//! A DevSecOps pipeline orchestrator.
//!
//! Secflow runs one commit through an ordered list of stages (build,
//! static analysis, quality gate, packaging, scans, deployment and
//! findings upload) with:
//!
//! - **Per-stage failure policy**: abort-on-failure or best-effort stages
//! - **Idempotent environments**: supporting services are reconciled, never
//!   blindly recreated, and persistent state survives pruning
//! - **Non-blocking quality gate**: analysis verdicts arrive on a channel
//!   with a bounded wait
//! - **One engagement per run**: all scan uploads of a run share a single
//!   tracker engagement
//! - **Guaranteed cleanup**: transient resources are reclaimed exactly once
//!   per run, whatever its outcome
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use secflow::prelude::*;
//!
//! let config = PipelineConfig::load("secflow.toml")?;
//! let pipeline = standard_pipeline(&config, &services)?;
//! let scheduler = StageScheduler::new(Arc::new(standard_cleanup(&config, &services)))
//!     .with_run_timeout(config.run.timeout());
//!
//! let run = scheduler.run(&pipeline, ctx).await;
//! println!("{}", run.to_json_pretty()?);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod core;
pub mod credentials;
pub mod environment;
pub mod errors;
pub mod events;
pub mod gate;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod tools;
pub mod tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::cleanup::{CleanupCoordinator, CleanupReport, WorkspaceRetention};
    pub use crate::config::PipelineConfig;
    pub use crate::context::{RunContext, RunIdentity, StageContext};
    pub use crate::core::{
        FailurePolicy, PipelineRun, RunOutcome, ScanArtifact, ScanType, StageOutput, StageResult,
        StageStatus,
    };
    pub use crate::credentials::{CredentialBroker, EnvSecretSource, SecretSource};
    pub use crate::environment::{
        ContainerRuntime, DockerCli, EnvironmentLeases, EnvironmentLifecycleManager,
        EnvironmentSpec, PruneScope, Retention, ServiceSpec,
    };
    pub use crate::errors::{SecflowError, StageError, TimeoutScope};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gate::{
        AnalysisServer, AnalysisServerPoller, AnalysisVerdict, GateVerdict, HttpAnalysisServer,
        QualityGateEvaluator, VerdictChannel,
    };
    pub use crate::pipeline::{
        standard_cleanup, standard_pipeline, Pipeline, PipelineBuilder, PipelineServices,
        StageScheduler, StageSpec,
    };
    pub use crate::stages::Stage;
    pub use crate::tools::{ProcessToolRunner, ToolInvocation, ToolOutcome, ToolRunner};
    pub use crate::tracker::{HttpTrackerClient, ScanResultPublisher, TrackerClient};
}
