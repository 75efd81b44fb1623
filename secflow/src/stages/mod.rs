//! Stage trait and implementations.
//!
//! Stages are the units of work a pipeline runs in order. The scheduler
//! owns timing, failure policy and cancellation; a stage only reports what
//! happened through its [`StageOutput`].

mod command;
mod environment;
mod gate;
mod upload;

pub use command::{expand_placeholders, CommandStage};
pub use environment::ReconcileEnvironmentStage;
pub use gate::{GateMode, QualityGateStage};
pub use upload::UploadFindingsStage;

use crate::context::StageContext;
use crate::core::StageOutput;
use async_trait::async_trait;
use std::fmt::Debug;

/// One unit of pipeline work.
///
/// `execute` reports failure through the returned [`StageOutput`] rather
/// than an error; a panic is treated as a crash of the whole run.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Stage name, unique within a pipeline.
    fn name(&self) -> &str;

    /// Runs the stage to completion.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}
