//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications with failure policy and timeout
//! - Pipeline builder with validation
//! - The sequential stage scheduler
//! - The standard DevSecOps pipeline template

mod builder;
mod scheduler;
mod spec;
mod template;


pub use builder::PipelineBuilder;
pub use scheduler::StageScheduler;
pub use spec::{Pipeline, StageSpec};
pub use template::{standard_cleanup, standard_pipeline, PipelineServices};
