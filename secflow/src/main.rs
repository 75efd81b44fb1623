//! `secflow` command line entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secflow::cancellation::CancellationToken;
use secflow::config::PipelineConfig;
use secflow::context::{RunContext, RunIdentity};
use secflow::core::RunOutcome;
use secflow::credentials::{CredentialBroker, EnvSecretSource};
use secflow::environment::{
    ContainerRuntime, DockerCli, EnvironmentLeases, EnvironmentLifecycleManager, PruneScope,
};
use secflow::events::LoggingEventSink;
use secflow::gate::VerdictChannel;
use secflow::observability::{init_tracing, LogFormat};
use secflow::pipeline::{standard_cleanup, standard_pipeline, PipelineServices, StageScheduler};
use secflow::tools::{ProcessToolRunner, ToolRunner};
use secflow::tracker::HttpTrackerClient;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "secflow", version, about = "DevSecOps pipeline orchestrator")]
struct Cli {
    /// Path to the pipeline configuration.
    #[arg(long, short, global = true, default_value = "secflow.toml", env = "SECFLOW_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline for one revision.
    Run {
        /// Commit being built.
        #[arg(long)]
        revision: String,
        /// CI build number.
        #[arg(long)]
        build_number: u64,
    },
    /// Reclaim environment resources outside of a run.
    Prune {
        /// Remove persistent resources too.
        #[arg(long, requires = "confirm")]
        all: bool,
        /// Required with --all.
        #[arg(long = "i-understand-this-destroys-persistent-state")]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    if let Err(e) = init_tracing(format, cli.verbose) {
        eprintln!("secflow: could not initialise logging: {e}");
    }

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("secflow: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Run {
            revision,
            build_number,
        } => run(config, RunIdentity::new(revision, build_number)).await,
        Command::Prune { all, confirm } => {
            if all && !confirm {
                bail!("--all requires --i-understand-this-destroys-persistent-state");
            }
            let scope = if all {
                PruneScope::All
            } else {
                PruneScope::TransientOnly
            };
            prune(&config, scope).await
        }
    }
}

async fn run(config: PipelineConfig, identity: RunIdentity) -> Result<ExitCode> {
    let tools: Arc<dyn ToolRunner> = Arc::new(ProcessToolRunner::new());
    let credentials = Arc::new(CredentialBroker::new(Arc::new(EnvSecretSource::default())));

    // Checked up front; upload stages scope the token per execution.
    credentials
        .resolve(&config.tracker.token_secret)
        .context("resolving tracker token")?;
    let tracker = HttpTrackerClient::new(
        config.tracker.base_url.clone(),
        config.tracker.product_id,
        Duration::from_secs(config.tracker.request_timeout_secs),
    )?
    .with_auth_scheme(config.tracker.auth_scheme.clone())
    .with_retry(config.tracker.retry.clone());

    let services = PipelineServices {
        tools: tools.clone(),
        runtime: Arc::new(DockerCli::new(tools)),
        tracker: Arc::new(tracker),
        verdicts: Arc::new(VerdictChannel::new()),
        leases: leases(&config),
        credentials: credentials.clone(),
    };

    let pipeline = standard_pipeline(&config, &services)?;
    let scheduler = StageScheduler::new(Arc::new(standard_cleanup(&config, &services)))
        .with_run_timeout(config.run.timeout());

    let cancel = Arc::new(CancellationToken::new());
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel("interrupted");
            }
        }
    });

    let ctx = Arc::new(RunContext::new(
        identity,
        config.run.workspace.clone(),
        credentials,
        cancel,
        Arc::new(LoggingEventSink::new()),
    ));
    let run = scheduler.run(&pipeline, ctx).await;
    interrupt.abort();

    println!("{}", run.to_json_pretty()?);

    let outcome = run.outcome();
    info!(outcome = ?outcome, "Run finished");
    Ok(ExitCode::from(
        outcome.map_or(RunOutcome::Aborted.exit_code(), |o| o.exit_code()),
    ))
}

async fn prune(config: &PipelineConfig, scope: PruneScope) -> Result<ExitCode> {
    let tools: Arc<dyn ToolRunner> = Arc::new(ProcessToolRunner::new());
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(tools));
    let manager = EnvironmentLifecycleManager::new(runtime);
    let operator = RunIdentity::new("operator-prune", 0);

    let report = manager
        .prune_exclusive(&leases(config), &operator, &config.environment, scope)
        .await
        .context("acquiring environment lease for prune")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn leases(config: &PipelineConfig) -> EnvironmentLeases {
    match &config.run.lock_dir {
        Some(dir) => EnvironmentLeases::new().with_lock_dir(dir.clone()),
        None => EnvironmentLeases::new(),
    }
}
