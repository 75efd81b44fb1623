//! Testing utilities for secflow pipelines.
//!
//! This module provides:
//! - Mock stages
//! - In-memory container runtime and tracker
//! - Scripted tool runner and analysis server
//! - A run fixture for exercising a single stage

mod doubles;
mod fixtures;
mod mocks;

pub use doubles::{
    InMemoryContainerRuntime, InMemoryTracker, ScriptedAnalysisServer, ScriptedToolRunner,
};
pub use fixtures::TestRun;
pub use mocks::{FailingStage, MockStage, PanickingStage, SlowStage};
