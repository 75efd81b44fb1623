//! The canonical DevSecOps pipeline assembled from configuration.

use super::{Pipeline, PipelineBuilder, StageSpec};
use crate::cleanup::CleanupCoordinator;
use crate::config::{CommandConfig, PipelineConfig};
use crate::core::ScanType;
use crate::credentials::CredentialBroker;
use crate::environment::{ContainerRuntime, EnvironmentLeases, EnvironmentLifecycleManager};
use crate::errors::SecflowError;
use crate::gate::{
    AnalysisServerPoller, HttpAnalysisServer, QualityGateEvaluator, VerdictChannel,
};
use crate::stages::{
    CommandStage, QualityGateStage, ReconcileEnvironmentStage, Stage, UploadFindingsStage,
};
use crate::tools::ToolRunner;
use crate::tracker::{ScanResultPublisher, TrackerClient};
use std::sync::Arc;
use std::time::Duration;

/// Collaborators the standard stages delegate to.
#[derive(Debug, Clone)]
pub struct PipelineServices {
    /// Runs external tools.
    pub tools: Arc<dyn ToolRunner>,
    /// Container runtime backing the environment.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Findings tracker.
    pub tracker: Arc<dyn TrackerClient>,
    /// Channel analysis verdicts arrive on.
    pub verdicts: Arc<VerdictChannel>,
    /// Exclusive environment use across runs.
    pub leases: EnvironmentLeases,
    /// Holds gate, tracker and tool credentials.
    pub credentials: Arc<CredentialBroker>,
}

/// Builds the standard stage list:
///
/// | stage | policy |
/// |---|---|
/// | reconcile-environment, build, static-analysis, quality-gate, package | abort |
/// | image-scan, upload-image-scan | best effort |
/// | deploy | abort |
/// | dynamic-scan, upload-dynamic-scan, upload-static-analysis | best effort |
///
/// The scan stages and their uploads are omitted when not configured. The
/// first upload stage escalates engagement-creation failures.
///
/// # Errors
///
/// Returns an error if a stage is invalid or the gate poller cannot be built.
pub fn standard_pipeline(
    config: &PipelineConfig,
    services: &PipelineServices,
) -> Result<Pipeline, SecflowError> {
    let stages = &config.stages;
    let manager = EnvironmentLifecycleManager::new(services.runtime.clone());
    let publisher = Arc::new(ScanResultPublisher::new(
        services.tracker.clone(),
        config.tracker.product_id,
        config.tracker.product_name.clone(),
    )
    .with_token_secret(config.tracker.token_secret.clone()));
    let mut uploads = UploadChain::new(publisher);
    let mut builder = PipelineBuilder::new(config.run.pipeline_name.clone());

    builder.add_stage_spec(StageSpec::new(
        "reconcile-environment",
        Arc::new(ReconcileEnvironmentStage::new(
            "reconcile-environment",
            manager,
            config.environment.clone(),
            services.leases.clone(),
        )),
    ))?;
    builder.add_stage_spec(command_spec("build", &stages.build, None, services))?;
    builder.add_stage_spec(command_spec(
        "static-analysis",
        &stages.analyze,
        Some(ScanType::StaticAnalysisSummary),
        services,
    ))?;
    builder.add_stage_spec(StageSpec::new("quality-gate", gate_stage(config, services)?))?;
    builder.add_stage_spec(command_spec("package", &stages.package, None, services))?;

    if let Some(scan) = &stages.image_scan {
        builder.add_stage_spec(
            command_spec("image-scan", scan, Some(ScanType::DependencyScan), services)
                .best_effort(),
        )?;
        builder.add_stage_spec(uploads.next("upload-image-scan", ScanType::DependencyScan))?;
    }

    builder.add_stage_spec(command_spec("deploy", &stages.deploy, None, services))?;

    if let Some(scan) = &stages.dynamic_scan {
        builder.add_stage_spec(
            command_spec("dynamic-scan", scan, Some(ScanType::DynamicScan), services)
                .best_effort(),
        )?;
        builder.add_stage_spec(uploads.next("upload-dynamic-scan", ScanType::DynamicScan))?;
    }

    builder.add_stage_spec(uploads.next(
        "upload-static-analysis",
        ScanType::StaticAnalysisSummary,
    ))?;

    Ok(builder.build()?)
}

/// Builds the cleanup coordinator matching [`standard_pipeline`].
#[must_use]
pub fn standard_cleanup(config: &PipelineConfig, services: &PipelineServices) -> CleanupCoordinator {
    let mut cleanup = CleanupCoordinator::new(services.tools.clone())
        .with_workspace(config.run.workspace.clone())
        .with_environment(
            EnvironmentLifecycleManager::new(services.runtime.clone()),
            config.environment.clone(),
        )
        .with_leases(services.leases.clone())
        .with_workspace_retention(config.cleanup.workspace_retention)
        .with_step_timeout(Duration::from_secs(config.cleanup.step_timeout_secs));

    if let Some((program, args)) = config.cleanup.cache_trim.split_first() {
        cleanup = cleanup.with_cache_trim(program.clone(), args.to_vec());
    }
    cleanup
}

/// Hands out upload stages; only the first one escalates.
struct UploadChain {
    publisher: Arc<ScanResultPublisher>,
    issued: usize,
}

impl UploadChain {
    fn new(publisher: Arc<ScanResultPublisher>) -> Self {
        Self {
            publisher,
            issued: 0,
        }
    }

    fn next(&mut self, name: &str, scan_type: ScanType) -> StageSpec {
        let mut stage = UploadFindingsStage::new(name, self.publisher.clone(), scan_type);
        if self.issued == 0 {
            stage = stage.escalate_engagement_failure();
        }
        self.issued += 1;
        StageSpec::new(name, Arc::new(stage)).best_effort()
    }
}

fn command_spec(
    name: &str,
    command: &CommandConfig,
    produces: Option<ScanType>,
    services: &PipelineServices,
) -> StageSpec {
    let mut stage = CommandStage::new(name, command.program.clone(), services.tools.clone())
        .with_args(command.args.iter().cloned())
        .accept_exit_codes(command.accept_exit_codes.clone())
        .with_timeout(command.timeout());
    for (key, value) in &command.env {
        stage = stage.with_env(key.clone(), value.clone());
    }
    for (var, secret) in &command.secret_env {
        stage = stage.with_secret_env(var.clone(), secret.clone());
    }
    if let (Some(scan_type), Some(path)) = (produces, &command.artifact) {
        stage = stage.with_artifact(scan_type, path.clone());
    }
    StageSpec::new(name, Arc::new(stage)).with_timeout(command.timeout())
}

fn gate_stage(
    config: &PipelineConfig,
    services: &PipelineServices,
) -> Result<Arc<dyn Stage>, SecflowError> {
    let gate = &config.gate;
    let evaluator = QualityGateEvaluator::new(services.verdicts.clone());
    let mut stage = QualityGateStage::new("quality-gate", evaluator, gate.timeout());

    if let (Some(url), Some(project)) = (&gate.server_url, &gate.project_key) {
        let server = HttpAnalysisServer::new(
            url.clone(),
            Duration::from_secs(gate.request_timeout_secs),
        )?;
        let mut poller =
            AnalysisServerPoller::new(Arc::new(server), project.clone(), gate.report_task.clone())
                .with_interval(Duration::from_secs(gate.poll_interval_secs));
        if let Some(secret) = &gate.token_secret {
            // Fail before the run starts; the stage scopes the value itself.
            services.credentials.resolve(secret)?;
            poller = poller.with_token_secret(secret.clone());
        }
        stage = stage.with_poller(poller);
    }
    Ok(Arc::new(stage))
}
