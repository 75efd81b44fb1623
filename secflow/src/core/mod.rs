//! Core domain model types for secflow.
//!
//! This module contains the fundamental types used throughout the orchestrator:
//! - Stage status, failure policy and run outcome enums
//! - Stage output type with factory methods
//! - Scan artifacts
//! - Pipeline run and stage result records

mod artifact;
mod output;
mod run;
mod status;

pub use artifact::{ArtifactPayload, ScanArtifact, ScanType};
pub use output::{OutputStatus, ResourceConflict, StageOutput};
pub use run::{PipelineRun, StageResult};
pub use status::{FailurePolicy, RunOutcome, StageStatus};
