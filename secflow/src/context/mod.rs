//! Execution context for pipeline runs.
//!
//! This module provides:
//! - Run identity supplied at trigger time
//! - Run-level context shared by all stages
//! - Stage context handed to each unit of work
//! - Run-scoped artifact and resource bags

mod bags;
mod execution;
mod identity;

pub use bags::{ArtifactBag, HeldResources};
pub use execution::{scratch_dir, RunContext, StageContext};
pub use identity::RunIdentity;
