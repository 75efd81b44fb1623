//! Event sinks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// Receives run and stage events.
///
/// Emission must never fail or block the scheduler; sinks log and
/// swallow their own errors.
pub trait EventSink: Send + Sync + Debug {
    /// Emits `event_type` (e.g. `stage.failed`) with optional structured data.
    fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Event types that report something going wrong.
#[must_use]
pub fn is_failure_event(event_type: &str) -> bool {
    matches!(
        event_type,
        "stage.failed" | "stage.timed_out" | "run.aborted"
    )
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
///
/// Failure events go out at `warn`; everything else at `info`, or `debug`
/// for a [`LoggingEventSink::quiet`] sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink {
    quiet: bool,
}

impl LoggingEventSink {
    /// Logs routine events at `info`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs routine events at `debug`.
    #[must_use]
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        let stage = data
            .as_ref()
            .and_then(|d| d.get("stage"))
            .and_then(Value::as_str)
            .unwrap_or("-")
            .to_string();
        let data = data.map(|d| d.to_string()).unwrap_or_default();

        if is_failure_event(event_type) {
            warn!(event = event_type, stage = %stage, data = %data, "Pipeline event");
        } else if self.quiet {
            debug!(event = event_type, stage = %stage, data = %data, "Pipeline event");
        } else {
            info!(event = event_type, stage = %stage, data = %data, "Pipeline event");
        }
    }
}

/// One event captured by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    /// Event type.
    pub event_type: String,
    /// Attached data.
    pub data: Option<Value>,
    /// When the sink received it.
    pub at: DateTime<Utc>,
}

impl RecordedEvent {
    /// The `stage` field of the data, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.data.as_ref()?.get("stage")?.as_str()
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything received so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Events emitted for one stage.
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.stage() == Some(stage))
            .cloned()
            .collect()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.lock().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logging_sinks_accept_any_event() {
        NoOpEventSink.emit("stage.started", Some(json!({"stage": "build"})));
        LoggingEventSink::new().emit("run.aborted", Some(json!({"stage": "gate"})));
        LoggingEventSink::quiet().emit("stage.completed", None);
    }

    #[test]
    fn test_failure_events() {
        assert!(is_failure_event("stage.timed_out"));
        assert!(is_failure_event("run.aborted"));
        assert!(!is_failure_event("stage.ignored"));
    }

    #[test]
    fn test_collecting_sink_groups_by_stage() {
        let sink = CollectingEventSink::new();
        sink.emit("run.started", None);
        sink.emit("stage.started", Some(json!({"stage": "build"})));
        sink.emit("stage.started", Some(json!({"stage": "scan"})));
        sink.emit("stage.completed", Some(json!({"stage": "build"})));

        assert_eq!(sink.len(), 4);
        let build = sink.for_stage("build");
        assert_eq!(build.len(), 2);
        assert_eq!(build[1].event_type, "stage.completed");
        assert!(build[0].at <= build[1].at);
    }
}
