//! Run-level and stage-level execution contexts.

use super::{ArtifactBag, HeldResources, RunIdentity};
use crate::cancellation::CancellationToken;
use crate::credentials::CredentialBroker;
use crate::events::EventSink;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State shared by every stage of one run.
#[derive(Debug)]
pub struct RunContext {
    identity: RunIdentity,
    workspace: PathBuf,
    credentials: Arc<CredentialBroker>,
    cancel: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
    artifacts: ArtifactBag,
    held: HeldResources,
}

impl RunContext {
    /// Creates a run context.
    #[must_use]
    pub fn new(
        identity: RunIdentity,
        workspace: impl Into<PathBuf>,
        credentials: Arc<CredentialBroker>,
        cancel: Arc<CancellationToken>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let sink = events.clone();
        cancel.on_cancel(move |reason| {
            sink.emit("run.cancel_requested", Some(json!({"reason": reason})));
        });
        Self {
            identity,
            workspace: workspace.into(),
            credentials,
            cancel,
            events,
            artifacts: ArtifactBag::new(),
            held: HeldResources::new(),
        }
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Scratch directory reclaimed by cleanup.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        scratch_dir(&self.workspace, self.identity.build_number)
    }

    /// Directory holding captured stage output for this build.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.workspace
            .join("logs")
            .join(self.identity.build_number.to_string())
    }

    /// Returns the credential broker.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialBroker> {
        &self.credentials
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Returns artifacts produced so far.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactBag {
        &self.artifacts
    }

    /// Returns the guards held until cleanup finishes.
    #[must_use]
    pub fn held(&self) -> &HeldResources {
        &self.held
    }

    /// Emits an event through the run's sink.
    pub fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.emit(event_type, data);
    }
}

/// Per-run scratch directory under a workspace.
#[must_use]
pub fn scratch_dir(workspace: &Path, build_number: u64) -> PathBuf {
    workspace.join("runs").join(build_number.to_string())
}

/// Context handed to a stage's unit of work.
#[derive(Debug, Clone)]
pub struct StageContext {
    run: Arc<RunContext>,
    stage_name: String,
    ordinal: usize,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(run: Arc<RunContext>, stage_name: impl Into<String>, ordinal: usize) -> Self {
        Self {
            run,
            stage_name: stage_name.into(),
            ordinal,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the stage's ordinal position.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Returns the run context.
    #[must_use]
    pub fn run(&self) -> &Arc<RunContext> {
        &self.run
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        self.run.identity()
    }

    /// Path of this stage's captured output.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.run.log_dir().join(format!("{}.log", self.stage_name))
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.run.cancel_token().is_cancelled()
    }

    /// Emits an event tagged with this stage.
    pub fn emit(&self, event_type: &str, mut data: serde_json::Value) {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("stage".to_string(), serde_json::json!(self.stage_name));
        }
        self.run.emit(event_type, Some(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticSecretSource;
    use crate::events::CollectingEventSink;

    fn run_context(events: Arc<dyn EventSink>) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            RunIdentity::new("abc", 9),
            "/work",
            Arc::new(CredentialBroker::new(Arc::new(StaticSecretSource::new()))),
            Arc::new(CancellationToken::new()),
            events,
        ))
    }

    #[test]
    fn test_paths() {
        let ctx = StageContext::new(run_context(Arc::new(CollectingEventSink::new())), "build", 1);
        assert_eq!(ctx.log_path(), PathBuf::from("/work/logs/9/build.log"));
        assert_eq!(ctx.run().scratch_dir(), PathBuf::from("/work/runs/9"));
        assert_eq!(ctx.ordinal(), 1);
    }

    #[test]
    fn test_emit_tags_stage() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = StageContext::new(run_context(sink.clone()), "gate", 3);
        ctx.emit("gate.waiting", serde_json::json!({"timeout_ms": 10}));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "gate.waiting");
        assert_eq!(events[0].stage(), Some("gate"));
    }

    #[test]
    fn test_cancellation_visible_and_reported() {
        let sink = Arc::new(CollectingEventSink::new());
        let run = run_context(sink.clone());
        let ctx = StageContext::new(run.clone(), "build", 0);
        assert!(!ctx.is_cancelled());
        run.cancel_token().cancel("operator abort");
        run.cancel_token().cancel("interrupted");
        assert!(ctx.is_cancelled());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run.cancel_requested");
        assert_eq!(
            events[0].data.as_ref().unwrap()["reason"],
            serde_json::json!("operator abort")
        );
    }
}
