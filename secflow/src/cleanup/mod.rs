//! Post-run reclamation.
//!
//! The [`CleanupCoordinator`] runs once at the end of every run, whatever
//! its outcome. Steps run in order, each under its own timeout; a failing
//! step is recorded in the [`CleanupReport`] and the next step still runs.
//! Nothing here can change a run's outcome.

use crate::context::scratch_dir;
use crate::core::{PipelineRun, RunOutcome};
use crate::environment::{
    EnvironmentLeases, EnvironmentLifecycleManager, EnvironmentSpec, PruneScope,
};
use crate::tools::{ToolInvocation, ToolRunner};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// How many finalized run ids a coordinator remembers.
pub const FINALIZED_HISTORY: usize = 256;

/// What happens to a run's scratch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRetention {
    /// Always removed.
    #[default]
    Remove,
    /// Kept when the run did not succeed, for inspection.
    KeepOnFailure,
    /// Never removed.
    Keep,
}

impl WorkspaceRetention {
    /// True if the scratch directory of a run ending in `outcome` is kept.
    #[must_use]
    pub fn keeps(self, outcome: Option<RunOutcome>) -> bool {
        match self {
            Self::Remove => false,
            Self::KeepOnFailure => outcome != Some(RunOutcome::Success),
            Self::Keep => true,
        }
    }
}

/// Result of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStepReport {
    /// Step name.
    pub name: String,
    /// Whether the step succeeded.
    pub ok: bool,
    /// What the step did, or why it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Step wall time in milliseconds.
    pub duration_ms: u64,
}

/// Everything the cleanup pass did for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Run the report belongs to.
    pub run_id: Uuid,
    /// Steps in execution order.
    pub steps: Vec<CleanupStepReport>,
    /// True if this call was a repeat and did nothing.
    #[serde(default)]
    pub skipped: bool,
}

impl CleanupReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            steps: Vec::new(),
            skipped: false,
        }
    }

    /// Returns the failed steps.
    #[must_use]
    pub fn failures(&self) -> Vec<&CleanupStepReport> {
        self.steps.iter().filter(|s| !s.ok).collect()
    }

    /// True if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }

    /// Returns a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&CleanupStepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A build-cache trim command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTrim {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

/// Reclaims workspace, transient environment resources and build cache.
#[derive(Debug)]
pub struct CleanupCoordinator {
    runner: Arc<dyn ToolRunner>,
    environment: Option<(EnvironmentLifecycleManager, EnvironmentSpec)>,
    leases: Option<EnvironmentLeases>,
    workspace: Option<PathBuf>,
    retention: WorkspaceRetention,
    cache_trim: Option<CacheTrim>,
    step_timeout: Duration,
    finalized: Mutex<VecDeque<Uuid>>,
}

impl CleanupCoordinator {
    /// Creates a coordinator with no steps configured.
    #[must_use]
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            environment: None,
            leases: None,
            workspace: None,
            retention: WorkspaceRetention::default(),
            cache_trim: None,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            finalized: Mutex::new(VecDeque::new()),
        }
    }

    /// Prunes transient resources of the environment `spec` declares after
    /// each run. Services `spec` declares persistent are always kept.
    #[must_use]
    pub fn with_environment(
        mut self,
        manager: EnvironmentLifecycleManager,
        spec: EnvironmentSpec,
    ) -> Self {
        self.environment = Some((manager, spec));
        self
    }

    /// Prunes only when the run holds the environment's lease.
    ///
    /// A run that lost the lease to a concurrent run must not reclaim
    /// resources that run is using.
    #[must_use]
    pub fn with_leases(mut self, leases: EnvironmentLeases) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Removes the run's scratch directory under `workspace`.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Sets when the scratch directory is removed.
    #[must_use]
    pub fn with_workspace_retention(mut self, retention: WorkspaceRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Runs a cache-trim command.
    #[must_use]
    pub fn with_cache_trim(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.cache_trim = Some(CacheTrim {
            program: program.into(),
            args,
        });
        self
    }

    /// Sets the per-step timeout.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Returns how many finalized runs are remembered, at most
    /// [`FINALIZED_HISTORY`].
    #[must_use]
    pub fn finalized_count(&self) -> usize {
        self.finalized.lock().len()
    }

    /// Records `run_id` as finalized. False if it already was.
    fn mark_finalized(&self, run_id: Uuid) -> bool {
        let mut finalized = self.finalized.lock();
        if finalized.contains(&run_id) {
            return false;
        }
        if finalized.len() == FINALIZED_HISTORY {
            finalized.pop_front();
        }
        finalized.push_back(run_id);
        true
    }

    /// Runs every configured step for `run`.
    ///
    /// A second call for the same run does nothing and returns a report
    /// marked `skipped`.
    pub async fn finalize(&self, run: &PipelineRun) -> CleanupReport {
        let identity = run.identity();
        let mut report = CleanupReport::new(identity.run_id);

        if !self.mark_finalized(identity.run_id) {
            warn!(run_id = %identity.run_id, "Cleanup already ran for this run");
            report.skipped = true;
            return report;
        }

        if let Some(workspace) = &self.workspace {
            let dir = scratch_dir(workspace, identity.build_number);
            if self.retention.keeps(run.outcome()) {
                info!(path = %dir.display(), retention = ?self.retention, "Workspace kept");
                report.steps.push(CleanupStepReport {
                    name: "workspace".to_string(),
                    ok: true,
                    detail: Some(format!("kept {}", dir.display())),
                    duration_ms: 0,
                });
            } else {
                report.steps.push(
                    self.run_step("workspace", async move {
                        match tokio::fs::remove_dir_all(&dir).await {
                            Ok(()) => Ok(format!("removed {}", dir.display())),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                                Ok("nothing to remove".to_string())
                            }
                            Err(e) => Err(format!("{}: {e}", dir.display())),
                        }
                    })
                    .await,
                );
            }
        }

        if let Some((manager, spec)) = &self.environment {
            let environment = &spec.name;
            let held_elsewhere = self
                .leases
                .as_ref()
                .is_some_and(|leases| !leases.is_held_by(environment, identity));
            if held_elsewhere {
                info!(environment = %environment, "Environment not held by this run; prune skipped");
                report.steps.push(CleanupStepReport {
                    name: "prune-transient".to_string(),
                    ok: true,
                    detail: Some("skipped: environment not held by this run".to_string()),
                    duration_ms: 0,
                });
            } else {
                report.steps.push(
                    self.run_step("prune-transient", async move {
                        let pruned = manager.prune(spec, PruneScope::TransientOnly).await;
                        let summary = format!(
                            "removed {}, kept {}",
                            pruned.removed.len(),
                            pruned.kept.len()
                        );
                        if pruned.is_clean() {
                            Ok(summary)
                        } else {
                            let failed: Vec<String> = pruned
                                .failures
                                .iter()
                                .map(|(name, err)| format!("{name}: {err}"))
                                .collect();
                            Err(format!("{summary}; failed: {}", failed.join("; ")))
                        }
                    })
                    .await,
                );
            }
        }

        if let Some(trim) = &self.cache_trim {
            let invocation = ToolInvocation::new(&trim.program)
                .args(trim.args.clone())
                .timeout(self.step_timeout);
            let runner = Arc::clone(&self.runner);
            report.steps.push(
                self.run_step("cache-trim", async move {
                    match runner.run(&invocation).await {
                        Ok(outcome) if outcome.success() => Ok(invocation.display_command()),
                        Ok(outcome) => Err(format!(
                            "{} exited with {:?}",
                            invocation.display_command(),
                            outcome.exit_code
                        )),
                        Err(e) => Err(e.to_string()),
                    }
                })
                .await,
            );
        }

        let failures = report.failures().len();
        if failures == 0 {
            info!(run_id = %identity.run_id, steps = report.steps.len(), "Cleanup finished");
        } else {
            warn!(
                run_id = %identity.run_id,
                steps = report.steps.len(),
                failures,
                "Cleanup finished with failures"
            );
        }
        report
    }

    async fn run_step<F>(&self, name: &str, step: F) -> CleanupStepReport
    where
        F: Future<Output = Result<String, String>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.step_timeout, step).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (ok, detail) = match result {
            Ok(Ok(detail)) => (true, detail),
            Ok(Err(error)) => {
                warn!(step = %name, error = %error, "Cleanup step failed");
                (false, error)
            }
            Err(_) => {
                let msg = format!("timed out after {}ms", self.step_timeout.as_millis());
                warn!(step = %name, "Cleanup step timed out");
                (false, msg)
            }
        };

        CleanupStepReport {
            name: name.to_string(),
            ok,
            detail: Some(detail),
            duration_ms,
        }
    }
}
