//! Sequential stage scheduler.
//!
//! Runs a [`Pipeline`]'s stages strictly in ordinal order, one at a time,
//! classifies each outcome against the stage's failure policy and always
//! finishes with the cleanup coordinator.

use super::{Pipeline, StageSpec};
use crate::cleanup::CleanupCoordinator;
use crate::context::{RunContext, StageContext};
use crate::core::{
    FailurePolicy, OutputStatus, PipelineRun, RunOutcome, StageOutput, StageResult, StageStatus,
};
use crate::errors::{StageError, TimeoutScope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, info_span, warn, Instrument};

/// How a dispatched stage came to an end.
#[derive(Debug)]
enum Completion {
    Finished(StageOutput),
    Crashed(String),
    TimedOut(TimeoutScope, Duration),
    Cancelled(String),
}

/// Terminal classification of one stage.
#[derive(Debug)]
struct Verdict {
    status: StageStatus,
    error: Option<StageError>,
    outcome: Option<RunOutcome>,
}

/// Drives one pipeline run.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    cleanup: Arc<CleanupCoordinator>,
    run_timeout: Option<Duration>,
}

impl StageScheduler {
    /// Creates a scheduler that finalizes every run with `cleanup`.
    #[must_use]
    pub fn new(cleanup: Arc<CleanupCoordinator>) -> Self {
        Self {
            cleanup,
            run_timeout: None,
        }
    }

    /// Bounds the whole run; stages still executing when it expires time out.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Returns the cleanup coordinator.
    #[must_use]
    pub fn cleanup(&self) -> &Arc<CleanupCoordinator> {
        &self.cleanup
    }

    /// Executes `pipeline` and returns the sealed run record.
    ///
    /// Cleanup runs exactly once whatever the outcome; guards parked in the
    /// run's held resources are released only after it returns.
    pub async fn run(&self, pipeline: &Pipeline, ctx: Arc<RunContext>) -> PipelineRun {
        let identity = ctx.identity().clone();
        let results = pipeline
            .stages()
            .iter()
            .enumerate()
            .map(|(ordinal, spec)| StageResult::pending(&spec.name, ordinal, spec.policy))
            .collect();
        let mut run = PipelineRun::new(identity.clone(), pipeline.name(), results);
        let deadline = self.run_timeout.map(|t| Instant::now() + t);

        info!(
            run_id = %identity.run_id,
            build_number = identity.build_number,
            revision = %identity.revision,
            pipeline = %pipeline.name(),
            stages = pipeline.len(),
            "Run started"
        );
        ctx.emit(
            "run.started",
            Some(json!({
                "run_id": identity.run_id.to_string(),
                "build_number": identity.build_number,
                "revision": identity.revision,
                "pipeline": pipeline.name(),
            })),
        );

        for (ordinal, spec) in pipeline.stages().iter().enumerate() {
            if let Some(reason) = ctx.cancel_token().reason() {
                warn!(stage = %spec.name, reason = %reason, "Run cancelled before dispatch");
                run.decide(RunOutcome::Aborted);
                self.emit_aborted(&ctx, &spec.name, &reason);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(stage = %spec.name, "Run budget exhausted before dispatch");
                run.decide(RunOutcome::Aborted);
                self.emit_aborted(&ctx, &spec.name, "run timeout");
                break;
            }

            if let Some(result) = run.stage_mut(ordinal) {
                result.start();
            }
            ctx.emit(
                "stage.started",
                Some(json!({"stage": spec.name, "ordinal": ordinal, "policy": spec.policy})),
            );

            let completion = self.dispatch(spec, ordinal, &ctx, deadline).await;
            let verdict = classify(spec, completion, &mut run, ordinal, &ctx);
            self.report(&ctx, spec, &verdict, &run, ordinal);

            if let Some(outcome) = verdict.outcome {
                run.decide(outcome);
                let reason = verdict
                    .error
                    .as_ref()
                    .map_or_else(|| "stage failed".to_string(), ToString::to_string);
                self.emit_aborted(&ctx, &spec.name, &reason);
                break;
            }
        }

        run.decide(RunOutcome::Success);
        let report = self.cleanup.finalize(&run).await;
        if report.is_clean() {
            info!(run_id = %identity.run_id, steps = report.steps.len(), "Cleanup completed");
        } else {
            warn!(
                run_id = %identity.run_id,
                failures = report.failures().len(),
                "Cleanup completed with failures"
            );
        }
        ctx.emit(
            "cleanup.completed",
            Some(json!({
                "steps": report.steps.len(),
                "failures": report.failures().len(),
                "skipped": report.skipped,
            })),
        );
        run.seal(report);
        ctx.held().release_all();

        let outcome = run.outcome().unwrap_or(RunOutcome::Success);
        info!(run_id = %identity.run_id, outcome = %outcome, "Run completed");
        ctx.emit(
            "run.completed",
            Some(json!({
                "outcome": outcome,
                "executed": run.executed_stages(),
            })),
        );
        run
    }

    /// Runs one stage's unit of work on its own task, racing it against the
    /// stage timeout, the run budget and cancellation.
    async fn dispatch(
        &self,
        spec: &StageSpec,
        ordinal: usize,
        ctx: &Arc<RunContext>,
        run_deadline: Option<Instant>,
    ) -> Completion {
        let now = Instant::now();
        let stage_deadline = spec.timeout.map(|t| (now + t, TimeoutScope::Stage, t));
        let run_limit = run_deadline.map(|d| {
            (
                d,
                TimeoutScope::Run,
                self.run_timeout.unwrap_or_default(),
            )
        });
        let limit = match (stage_deadline, run_limit) {
            (Some(stage), Some(run)) if run.0 < stage.0 => Some(run),
            (Some(stage), _) => Some(stage),
            (None, run) => run,
        };

        let runner = spec.runner.clone();
        let stage_ctx = StageContext::new(ctx.clone(), &spec.name, ordinal);
        let span = info_span!("stage", stage = %spec.name, ordinal, policy = %spec.policy);
        let mut handle = tokio::spawn(async move { runner.execute(&stage_ctx).await }.instrument(span));

        let expiry = async {
            match limit {
                Some((at, _, _)) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancel = ctx.cancel_token().clone();

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(output) => Completion::Finished(output),
                Err(e) => Completion::Crashed(describe_join_error(e)),
            },
            () = expiry => {
                handle.abort();
                let _ = (&mut handle).await;
                let (_, scope, budget) = limit.unwrap_or((now, TimeoutScope::Stage, Duration::ZERO));
                Completion::TimedOut(scope, budget)
            }
            () = cancel.cancelled() => {
                handle.abort();
                let _ = (&mut handle).await;
                Completion::Cancelled(cancel.reason().unwrap_or("cancelled").to_string())
            }
        }
    }

    fn report(
        &self,
        ctx: &RunContext,
        spec: &StageSpec,
        verdict: &Verdict,
        run: &PipelineRun,
        ordinal: usize,
    ) {
        let duration_ms = run.stages().get(ordinal).and_then(StageResult::duration_ms);
        let detail = verdict.error.as_ref().map(ToString::to_string);
        let event = match verdict.status {
            StageStatus::Succeeded => "stage.completed",
            StageStatus::FailedIgnored => "stage.ignored",
            StageStatus::TimedOut => "stage.timed_out",
            _ => "stage.failed",
        };

        match verdict.status {
            StageStatus::Succeeded => {
                info!(stage = %spec.name, duration_ms = ?duration_ms, "Stage succeeded");
            }
            StageStatus::FailedIgnored => {
                warn!(stage = %spec.name, error = ?detail, "Stage failed; continuing under best-effort policy");
            }
            _ => error!(stage = %spec.name, status = %verdict.status, error = ?detail, "Stage failed"),
        }

        ctx.emit(
            event,
            Some(json!({
                "stage": spec.name,
                "ordinal": ordinal,
                "status": verdict.status,
                "duration_ms": duration_ms,
                "error": detail,
            })),
        );
    }

    fn emit_aborted(&self, ctx: &RunContext, stage: &str, reason: &str) {
        ctx.emit("run.aborted", Some(json!({"stage": stage, "reason": reason})));
    }
}

/// Maps a completion onto the stage's status, error and run-level effect,
/// and records it in the run.
fn classify(
    spec: &StageSpec,
    completion: Completion,
    run: &mut PipelineRun,
    ordinal: usize,
    ctx: &RunContext,
) -> Verdict {
    let stage = spec.name.clone();
    let best_effort = spec.policy == FailurePolicy::BestEffort;

    let verdict = match completion {
        Completion::Finished(output) => {
            let verdict = classify_output(&stage, best_effort, &output);
            if let Some(result) = run.stage_mut(ordinal) {
                result.data.extend(output.data.clone());
                result.output_ref = output.output_ref.clone();
            }
            if output.is_success() {
                for artifact in output.artifacts {
                    ctx.artifacts().push(artifact);
                }
            }
            verdict
        }
        Completion::Crashed(message) => Verdict {
            status: if best_effort {
                StageStatus::FailedIgnored
            } else {
                StageStatus::FailedFatal
            },
            error: Some(StageError::Crashed { stage, message }),
            outcome: (!best_effort).then_some(RunOutcome::Failed),
        },
        Completion::TimedOut(scope, budget) => {
            let aborts = scope == TimeoutScope::Run || !best_effort;
            Verdict {
                status: StageStatus::TimedOut,
                error: Some(StageError::Timeout {
                    stage,
                    scope,
                    timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                }),
                outcome: aborts.then_some(RunOutcome::Aborted),
            }
        }
        Completion::Cancelled(reason) => Verdict {
            status: StageStatus::FailedFatal,
            error: Some(StageError::Cancelled { stage, reason }),
            outcome: Some(RunOutcome::Aborted),
        },
    };

    if let Some(result) = run.stage_mut(ordinal) {
        result.finish(verdict.status, verdict.error.clone());
    }
    verdict
}

fn classify_output(stage: &str, best_effort: bool, output: &StageOutput) -> Verdict {
    let message = || output.error.clone().unwrap_or_else(|| "stage failed".to_string());

    if let Some(conflict) = &output.conflict {
        return Verdict {
            status: StageStatus::FailedFatal,
            error: Some(StageError::ResourceConflict {
                stage: stage.to_string(),
                environment: conflict.environment.clone(),
                holder: conflict.holder.clone(),
            }),
            outcome: Some(RunOutcome::Aborted),
        };
    }

    match output.status {
        OutputStatus::Ok => Verdict {
            status: StageStatus::Succeeded,
            error: None,
            outcome: None,
        },
        OutputStatus::Fail if best_effort => Verdict {
            status: StageStatus::FailedIgnored,
            error: Some(StageError::Ignorable {
                stage: stage.to_string(),
                message: message(),
            }),
            outcome: None,
        },
        OutputStatus::Fail | OutputStatus::Fatal => Verdict {
            status: StageStatus::FailedFatal,
            error: Some(StageError::Fatal {
                stage: stage.to_string(),
                message: message(),
            }),
            outcome: Some(RunOutcome::Aborted),
        },
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            return format!("panicked: {s}");
        }
        if let Some(s) = payload.downcast_ref::<String>() {
            return format!("panicked: {s}");
        }
        return "panicked".to_string();
    }
    err.to_string()
}
