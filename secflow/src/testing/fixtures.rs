//! Test fixtures for stage testing.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::context::{RunContext, RunIdentity, StageContext};
use crate::credentials::{CredentialBroker, StaticSecretSource};
use crate::events::{CollectingEventSink, EventSink};

/// Builds a run context for exercising a single stage.
#[derive(Debug)]
pub struct TestRun {
    identity: RunIdentity,
    workspace: PathBuf,
    secrets: StaticSecretSource,
    events: Arc<CollectingEventSink>,
}

impl Default for TestRun {
    fn default() -> Self {
        Self {
            identity: RunIdentity::new("abc123", 1),
            workspace: std::env::temp_dir().join("secflow-test"),
            secrets: StaticSecretSource::new(),
            events: Arc::new(CollectingEventSink::new()),
        }
    }
}

impl TestRun {
    /// Creates a fixture for build 1 of revision `abc123`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run identity.
    #[must_use]
    pub fn with_identity(mut self, revision: impl Into<String>, build_number: u64) -> Self {
        self.identity = RunIdentity::new(revision, build_number);
        self
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Adds a secret.
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets = self.secrets.with(name, value);
        self
    }

    /// Returns the sink that collects the run's events.
    #[must_use]
    pub fn events(&self) -> Arc<CollectingEventSink> {
        self.events.clone()
    }

    /// Builds the run context.
    #[must_use]
    pub fn run_context(self) -> Arc<RunContext> {
        let events: Arc<dyn EventSink> = self.events;
        Arc::new(RunContext::new(
            self.identity,
            self.workspace,
            Arc::new(CredentialBroker::new(Arc::new(self.secrets))),
            Arc::new(CancellationToken::new()),
            events,
        ))
    }

    /// Builds a context for one stage at ordinal 0.
    #[must_use]
    pub fn stage_context(self, stage_name: &str) -> StageContext {
        StageContext::new(self.run_context(), stage_name, 0)
    }
}
