//! Engagement creation and scan upload.

use super::client::TrackerClient;
use super::model::{EngagementRef, EngagementRequest, ImportScanRequest, PublishResult};
use crate::context::RunIdentity;
use crate::core::{ArtifactPayload, ScanArtifact};
use crate::errors::TrackerError;
use chrono::Utc;
use dashmap::DashMap;
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Credential name the tracker token is resolved from by default.
pub const DEFAULT_TOKEN_SECRET: &str = "tracker_token";

/// Publishes scan artifacts against one engagement per run.
///
/// Engagement creation is idempotent by name: concurrent callers for the
/// same run serialise on a per-name lock, look the engagement up before
/// creating it, and look it up again if creation fails.
///
/// The publisher knows only the name of the token's credential; callers
/// resolve it for the duration of one upload and pass it in.
#[derive(Debug)]
pub struct ScanResultPublisher {
    client: Arc<dyn TrackerClient>,
    product_id: u64,
    product_name: String,
    token_secret: String,
    engagements: DashMap<String, EngagementRef>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ScanResultPublisher {
    /// Creates a publisher for one tracker product.
    #[must_use]
    pub fn new(client: Arc<dyn TrackerClient>, product_id: u64, product_name: impl Into<String>) -> Self {
        Self {
            client,
            product_id,
            product_name: product_name.into(),
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            engagements: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Sets the credential the tracker token is resolved from.
    #[must_use]
    pub fn with_token_secret(mut self, name: impl Into<String>) -> Self {
        self.token_secret = name.into();
        self
    }

    /// Returns the product name uploads are filed under.
    #[must_use]
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    /// Returns the credential name of the tracker token.
    #[must_use]
    pub fn token_secret(&self) -> &str {
        &self.token_secret
    }

    /// Returns the engagement for a run, creating it only if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the engagement can be neither found nor created.
    pub async fn ensure_engagement(
        &self,
        identity: &RunIdentity,
        token: &SecretString,
    ) -> Result<EngagementRef, TrackerError> {
        let name = identity.engagement_name();
        if let Some(found) = self.engagements.get(&name) {
            return Ok(found.clone());
        }

        let lock = self
            .creation_locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(found) = self.engagements.get(&name) {
            return Ok(found.clone());
        }

        let engagement = match self.client.find_engagement(&name, token).await? {
            Some(existing) => {
                info!(engagement = %name, id = existing.id, "Reusing engagement");
                existing
            }
            None => {
                let request =
                    EngagementRequest::for_run(identity, self.product_id, Utc::now().date_naive());
                match self.client.create_engagement(&request, token).await {
                    Ok(created) => {
                        info!(engagement = %name, id = created.id, "Created engagement");
                        created
                    }
                    Err(e) => {
                        // Another process may have won the race.
                        warn!(engagement = %name, error = %e, "Engagement creation failed, checking for existing");
                        match self.client.find_engagement(&name, token).await {
                            Ok(Some(existing)) => existing,
                            _ => return Err(e),
                        }
                    }
                }
            }
        };

        self.engagements.insert(name, engagement.clone());
        Ok(engagement)
    }

    /// Uploads one artifact against an engagement.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be read or the upload fails.
    pub async fn publish(
        &self,
        engagement: &EngagementRef,
        artifact: &ScanArtifact,
        token: &SecretString,
    ) -> Result<PublishResult, TrackerError> {
        let payload = match &artifact.payload {
            ArtifactPayload::File { path } => {
                tokio::fs::read(path)
                    .await
                    .map_err(|e| TrackerError::Artifact {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?
            }
            ArtifactPayload::Inline { bytes, .. } => bytes.clone(),
        };
        let file_name = artifact.file_name();

        let request = ImportScanRequest {
            scan_type: artifact.scan_type,
            product_name: self.product_name.clone(),
            engagement_name: engagement.name.clone(),
            file_name: file_name.clone(),
            payload,
            active: true,
            verified: true,
        };
        let response = self.client.import_scan(request, token).await?;

        info!(
            engagement = %engagement.name,
            scan_type = %artifact.scan_type,
            file = %file_name,
            test_id = ?response.test_id,
            "Published scan artifact"
        );

        Ok(PublishResult {
            engagement: engagement.clone(),
            scan_type: artifact.scan_type,
            file_name,
            test_id: response.test_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScanType;
    use crate::testing::InMemoryTracker;
    use secrecy::ExposeSecret;
    use crate::tracker::client::MockTrackerClient;
    use crate::tracker::model::ImportScanResponse;
    use pretty_assertions::assert_eq;

    fn token() -> SecretString {
        SecretString::from("tracker-token-1".to_string())
    }

    #[tokio::test]
    async fn test_ensure_engagement_creates_once() {
        let tracker = Arc::new(InMemoryTracker::new());
        let publisher = ScanResultPublisher::new(tracker.clone(), 1, "app");
        let identity = RunIdentity::new("abc", 42);

        let first = publisher.ensure_engagement(&identity, &token()).await.unwrap();
        let second = publisher.ensure_engagement(&identity, &token()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "CI/CD Build 42");
        assert_eq!(tracker.create_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_engagement_creates_once() {
        let tracker = Arc::new(InMemoryTracker::new());
        let publisher = Arc::new(ScanResultPublisher::new(tracker.clone(), 1, "app"));
        let identity = RunIdentity::new("abc", 42);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let publisher = publisher.clone();
                let identity = identity.clone();
                tokio::spawn(async move { publisher.ensure_engagement(&identity, &token()).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(tracker.engagements_named("CI/CD Build 42"), 1);
    }

    #[tokio::test]
    async fn test_existing_engagement_reused() {
        let mut mock = MockTrackerClient::new();
        mock.expect_find_engagement()
            .withf(|name, token| {
                name == "CI/CD Build 7" && token.expose_secret() == "tracker-token-1"
            })
            .times(1)
            .returning(|name, _| {
                Ok(Some(EngagementRef {
                    id: 70,
                    name: name.to_string(),
                }))
            });
        mock.expect_create_engagement().never();

        let publisher = ScanResultPublisher::new(Arc::new(mock), 1, "app");
        let engagement = publisher
            .ensure_engagement(&RunIdentity::new("abc", 7), &token())
            .await
            .unwrap();
        assert_eq!(engagement.id, 70);
    }

    #[tokio::test]
    async fn test_lost_creation_race_reuses_winner() {
        let mut mock = MockTrackerClient::new();
        let mut lookups = 0;
        mock.expect_find_engagement().times(2).returning(move |name, _| {
            lookups += 1;
            if lookups == 1 {
                Ok(None)
            } else {
                Ok(Some(EngagementRef {
                    id: 5,
                    name: name.to_string(),
                }))
            }
        });
        mock.expect_create_engagement().times(1).returning(|_, _| {
            Err(TrackerError::Status {
                endpoint: "engagements/".to_string(),
                status: 400,
                body: "engagement with this name already exists".to_string(),
            })
        });

        let publisher = ScanResultPublisher::new(Arc::new(mock), 1, "app");
        let engagement = publisher
            .ensure_engagement(&RunIdentity::new("abc", 9), &token())
            .await
            .unwrap();
        assert_eq!(engagement.id, 5);
    }

    #[tokio::test]
    async fn test_creation_failure_propagates() {
        let tracker = Arc::new(InMemoryTracker::new());
        tracker.fail_creates(true);
        let publisher = ScanResultPublisher::new(tracker, 1, "app");
        assert!(publisher
            .ensure_engagement(&RunIdentity::new("abc", 1), &token())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_publish_file_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("trivy.json");
        std::fs::write(&report, br#"{"Results": []}"#).unwrap();

        let tracker = Arc::new(InMemoryTracker::new());
        let publisher = ScanResultPublisher::new(tracker.clone(), 1, "app");
        let engagement = publisher
            .ensure_engagement(&RunIdentity::new("abc", 3), &token())
            .await
            .unwrap();

        let result = publisher
            .publish(
                &engagement,
                &ScanArtifact::file(ScanType::DependencyScan, &report),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(result.file_name, "trivy.json");
        assert_eq!(result.scan_type, ScanType::DependencyScan);

        let imports = tracker.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].engagement_name, "CI/CD Build 3");
        assert_eq!(imports[0].product_name, "app");
        assert!(imports[0].active && imports[0].verified);
    }

    #[tokio::test]
    async fn test_publish_missing_file() {
        let mut mock = MockTrackerClient::new();
        mock.expect_import_scan().never();
        let publisher = ScanResultPublisher::new(Arc::new(mock), 1, "app");
        let engagement = EngagementRef {
            id: 1,
            name: "CI/CD Build 1".to_string(),
        };

        let err = publisher
            .publish(
                &engagement,
                &ScanArtifact::file(ScanType::DynamicScan, "/nonexistent/zap.xml"),
                &token(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Artifact { .. }));
    }

    #[tokio::test]
    async fn test_publish_inline_artifact() {
        let mut mock = MockTrackerClient::new();
        mock.expect_import_scan()
            .withf(|req, _| req.file_name == "sonar.json" && req.payload == b"{}".to_vec())
            .times(1)
            .returning(|_, _| Ok(ImportScanResponse { test_id: Some(11) }));
        let publisher = ScanResultPublisher::new(Arc::new(mock), 1, "app");

        let result = publisher
            .publish(
                &EngagementRef {
                    id: 1,
                    name: "CI/CD Build 1".to_string(),
                },
                &ScanArtifact::inline(ScanType::StaticAnalysisSummary, "sonar.json", b"{}".to_vec()),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(result.test_id, Some(11));
    }
}
