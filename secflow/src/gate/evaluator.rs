//! Bounded wait for a quality-gate verdict.

use super::{GateVerdict, VerdictChannel};
use crate::context::RunIdentity;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Waits for the analysis verdict of a run.
///
/// There is no retry: a timed-out wait needs a fresh run.
#[derive(Debug, Clone)]
pub struct QualityGateEvaluator {
    channel: Arc<VerdictChannel>,
}

impl QualityGateEvaluator {
    /// Creates an evaluator reading from a verdict channel.
    #[must_use]
    pub fn new(channel: Arc<VerdictChannel>) -> Self {
        Self { channel }
    }

    /// Returns the verdict channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<VerdictChannel> {
        &self.channel
    }

    /// Suspends until a verdict for `identity` arrives or `timeout` expires.
    pub async fn await_verdict(&self, identity: &RunIdentity, timeout: Duration) -> GateVerdict {
        let key = identity.verdict_key();
        let rx = self.channel.subscribe(&key);

        let verdict = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(verdict)) => GateVerdict::from(verdict),
            Ok(Err(_)) => {
                warn!(key = %key, "Verdict channel closed without a verdict");
                GateVerdict::Failed
            }
            Err(_) => {
                self.channel.unsubscribe(&key);
                GateVerdict::TimedOut
            }
        };

        info!(
            build_number = identity.build_number,
            verdict = %verdict,
            "Quality gate evaluated"
        );
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::AnalysisVerdict;

    #[tokio::test]
    async fn test_verdict_arrives_before_timeout() {
        let channel = Arc::new(VerdictChannel::new());
        let evaluator = QualityGateEvaluator::new(channel.clone());
        let identity = RunIdentity::new("abc", 5);

        let poster = {
            let channel = channel.clone();
            let key = identity.verdict_key();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                channel.post(&key, AnalysisVerdict::Passed);
            })
        };

        let verdict = evaluator
            .await_verdict(&identity, Duration::from_secs(2))
            .await;
        poster.await.unwrap();
        assert_eq!(verdict, GateVerdict::Passed);
    }

    #[tokio::test]
    async fn test_failed_verdict() {
        let channel = Arc::new(VerdictChannel::new());
        let identity = RunIdentity::new("abc", 5);
        channel.post(&identity.verdict_key(), AnalysisVerdict::Failed);

        let verdict = QualityGateEvaluator::new(channel)
            .await_verdict(&identity, Duration::from_millis(50))
            .await;
        assert_eq!(verdict, GateVerdict::Failed);
    }

    #[tokio::test]
    async fn test_timeout_without_verdict() {
        let channel = Arc::new(VerdictChannel::new());
        let identity = RunIdentity::new("abc", 5);

        let verdict = QualityGateEvaluator::new(channel.clone())
            .await_verdict(&identity, Duration::from_millis(20))
            .await;
        assert_eq!(verdict, GateVerdict::TimedOut);
        assert_eq!(channel.waiting(), 0);
    }

    #[tokio::test]
    async fn test_verdict_for_other_run_ignored() {
        let channel = Arc::new(VerdictChannel::new());
        channel.post(&RunIdentity::new("abc", 4).verdict_key(), AnalysisVerdict::Passed);

        let verdict = QualityGateEvaluator::new(channel)
            .await_verdict(&RunIdentity::new("abc", 5), Duration::from_millis(20))
            .await;
        assert_eq!(verdict, GateVerdict::TimedOut);
    }
}
