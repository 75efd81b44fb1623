//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::context::StageContext;
use crate::core::StageOutput;
use crate::stages::Stage;

/// A mock stage that records calls and returns a configurable output.
#[derive(Debug)]
pub struct MockStage {
    name: String,
    output: Mutex<StageOutput>,
    call_count: AtomicUsize,
}

impl MockStage {
    /// Creates a new mock stage with a success output.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::returning(name, StageOutput::ok())
    }

    /// Creates a mock stage returning `output`.
    #[must_use]
    pub fn returning(name: impl Into<String>, output: StageOutput) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(output),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Sets the output to return.
    pub fn set_output(&self, output: StageOutput) {
        *self.output.lock() = output;
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// True if the stage ran at least once.
    #[must_use]
    pub fn was_called(&self) -> bool {
        self.call_count() > 0
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.output.lock().clone()
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: String,
    fatal: bool,
}

impl FailingStage {
    /// Creates a stage whose failure is subject to its policy.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            fatal: false,
        }
    }

    /// Creates a stage whose failure stops the run regardless of policy.
    #[must_use]
    pub fn fatal(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            fatal: true,
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        if self.fatal {
            StageOutput::fatal(&self.error)
        } else {
            StageOutput::fail(&self.error)
        }
    }
}

/// A stage that takes time to execute.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
    started: AtomicBool,
    finished: AtomicBool,
    released: AtomicBool,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }

    /// True once execution began.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True if the delay elapsed without the stage being stopped.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// True once the unit of work has ended, finished or dropped.
    #[must_use]
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        self.started.store(true, Ordering::SeqCst);
        let _release = SetOnDrop(&self.released);
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        StageOutput::ok()
    }
}

/// A stage whose unit of work panics.
#[derive(Debug)]
pub struct PanickingStage {
    name: String,
    message: String,
}

impl PanickingStage {
    /// Creates a panicking stage.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Stage for PanickingStage {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::panic)]
    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        panic!("{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputStatus;
    use crate::testing::TestRun;

    #[tokio::test]
    async fn test_mock_stage() {
        let stage = MockStage::new("test");
        let ctx = TestRun::new().stage_context("test");
        assert!(!stage.was_called());

        assert!(stage.execute(&ctx).await.is_success());
        stage.set_output(StageOutput::fail("boom"));
        assert_eq!(stage.execute(&ctx).await.status, OutputStatus::Fail);
        assert_eq!(stage.call_count(), 2);
    }

    #[test]
    fn test_failing_stage() {
        let ctx = TestRun::new().stage_context("fail");
        let plain = FailingStage::new("fail", "Test error");
        let fatal = FailingStage::fatal("fail", "Test error");

        let output = tokio_test::block_on(plain.execute(&ctx));
        assert_eq!(output.status, OutputStatus::Fail);
        assert_eq!(output.error, Some("Test error".to_string()));
        assert_eq!(tokio_test::block_on(fatal.execute(&ctx)).status, OutputStatus::Fatal);
    }

    #[tokio::test]
    async fn test_slow_stage() {
        let stage = SlowStage::with_delay_ms("slow", 10);
        let ctx = TestRun::new().stage_context("slow");

        let start = std::time::Instant::now();
        assert!(stage.execute(&ctx).await.is_success());
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(stage.started() && stage.finished());
    }
}
