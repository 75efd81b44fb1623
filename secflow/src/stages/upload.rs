//! Scan upload stage.

use super::Stage;
use crate::context::StageContext;
use crate::core::{ScanType, StageOutput};
use crate::tracker::ScanResultPublisher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Uploads the latest artifact of one scan type to the run's engagement.
#[derive(Debug, Clone)]
pub struct UploadFindingsStage {
    name: String,
    publisher: Arc<ScanResultPublisher>,
    scan_type: ScanType,
    escalate_engagement_failure: bool,
}

impl UploadFindingsStage {
    /// Creates an upload stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        publisher: Arc<ScanResultPublisher>,
        scan_type: ScanType,
    ) -> Self {
        Self {
            name: name.into(),
            publisher,
            scan_type,
            escalate_engagement_failure: false,
        }
    }

    /// Makes a failure to obtain the engagement fatal for the run.
    ///
    /// Set on the first upload stage: later uploads have nothing to attach
    /// to without it.
    #[must_use]
    pub fn escalate_engagement_failure(mut self) -> Self {
        self.escalate_engagement_failure = true;
        self
    }
}

#[async_trait]
impl Stage for UploadFindingsStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let secret = self.publisher.token_secret();
        let scope = match ctx.run().credentials().scope(&[secret]) {
            Ok(scope) => scope,
            Err(e) => return self.engagement_unavailable(ctx, &e.to_string()),
        };
        let Some(token) = scope.get(secret).map(|c| c.secret()) else {
            return self.engagement_unavailable(ctx, "tracker token not in scope");
        };

        let engagement = match self.publisher.ensure_engagement(ctx.identity(), token).await {
            Ok(engagement) => engagement,
            Err(e) => return self.engagement_unavailable(ctx, &e.to_string()),
        };

        let Some(artifact) = ctx.run().artifacts().latest(self.scan_type) else {
            warn!(stage = %self.name, scan_type = %self.scan_type, "No artifact to upload");
            return StageOutput::fail(format!("no {} artifact was produced", self.scan_type))
                .with_data("engagement_id", serde_json::json!(engagement.id));
        };

        let published = self.publisher.publish(&engagement, &artifact, token).await;
        drop(scope);

        match published {
            Ok(result) => StageOutput::ok()
                .with_data("engagement_id", serde_json::json!(result.engagement.id))
                .with_data("engagement", serde_json::json!(result.engagement.name))
                .with_data("file", serde_json::json!(result.file_name))
                .with_data("test_id", serde_json::json!(result.test_id)),
            Err(e) => StageOutput::fail(e.to_string())
                .with_data("engagement_id", serde_json::json!(engagement.id)),
        }
    }
}

impl UploadFindingsStage {
    fn engagement_unavailable(&self, ctx: &StageContext, reason: &str) -> StageOutput {
        let message = format!(
            "engagement '{}' unavailable: {reason}",
            ctx.identity().engagement_name()
        );
        if self.escalate_engagement_failure {
            StageOutput::fatal(message)
        } else {
            StageOutput::fail(message)
        }
    }
}
