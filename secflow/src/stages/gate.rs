//! Quality-gate stage.

use super::Stage;
use crate::context::StageContext;
use crate::core::StageOutput;
use crate::gate::{AnalysisServerPoller, GateVerdict, QualityGateEvaluator};
use async_trait::async_trait;
use secrecy::SecretString;
use std::time::Duration;

/// Where the verdict comes from.
#[derive(Debug, Clone)]
pub enum GateMode {
    /// Something else posts into the verdict channel.
    External,
    /// Follow this run's analysis task on the server while waiting.
    Poll(AnalysisServerPoller),
}

/// Waits for the analysis verdict of the current run.
///
/// A failed or missing verdict stops the run whatever policy the stage is
/// declared with: a stalled analysis must not let deployment proceed.
#[derive(Debug, Clone)]
pub struct QualityGateStage {
    name: String,
    evaluator: QualityGateEvaluator,
    timeout: Duration,
    mode: GateMode,
}

impl QualityGateStage {
    /// Creates a gate stage waiting on out-of-band verdicts.
    #[must_use]
    pub fn new(name: impl Into<String>, evaluator: QualityGateEvaluator, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            evaluator,
            timeout,
            mode: GateMode::External,
        }
    }

    /// Polls the analysis server while waiting.
    #[must_use]
    pub fn with_poller(mut self, poller: AnalysisServerPoller) -> Self {
        self.mode = GateMode::Poll(poller);
        self
    }

    /// Returns the verdict wait timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Stage for QualityGateStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let identity = ctx.identity();
        ctx.emit(
            "gate.waiting",
            serde_json::json!({"timeout_ms": self.timeout.as_millis() as u64}),
        );

        let poller = match &self.mode {
            GateMode::External => None,
            GateMode::Poll(poller) => {
                let token = match poller.token_secret() {
                    None => None,
                    Some(secret) => match ctx.run().credentials().scope(&[secret]) {
                        Ok(scope) => scope
                            .get(secret)
                            .map(|c| SecretString::from(c.expose().to_string())),
                        Err(e) => {
                            return StageOutput::fatal(format!(
                                "analysis server token unavailable: {e}"
                            ))
                        }
                    },
                };
                Some(poller.clone().spawn(
                    ctx.run().workspace(),
                    self.evaluator.channel().clone(),
                    identity.verdict_key(),
                    token,
                    ctx.run().cancel_token().clone(),
                ))
            }
        };

        let verdict = self.evaluator.await_verdict(identity, self.timeout).await;
        if let Some(mut handle) = poller {
            handle.abort();
            let _ = (&mut handle).await;
        }

        match verdict {
            GateVerdict::Passed => StageOutput::ok_value("verdict", serde_json::json!(verdict)),
            GateVerdict::Failed => StageOutput::fatal("quality gate failed")
                .with_data("verdict", serde_json::json!(verdict)),
            GateVerdict::TimedOut => StageOutput::fatal(format!(
                "no quality gate verdict within {}ms",
                self.timeout.as_millis()
            ))
            .with_data("verdict", serde_json::json!(verdict)),
        }
    }
}
