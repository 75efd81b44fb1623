//! Event sink system for run observability.
//!
//! The scheduler reports every state transition through an [`EventSink`]:
//! `run.started`, `stage.started`, `stage.completed`, `stage.failed`,
//! `stage.ignored`, `stage.timed_out`, `run.aborted`, `cleanup.completed`
//! and `run.completed`.

mod sink;

pub use sink::{
    is_failure_event, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent,
};
