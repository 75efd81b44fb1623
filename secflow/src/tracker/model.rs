//! Findings-tracker wire types.

use crate::context::RunIdentity;
use crate::core::ScanType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Engagement status sent on creation.
pub const ENGAGEMENT_STATUS: &str = "In Progress";

/// Engagement type sent on creation.
pub const ENGAGEMENT_TYPE: &str = "CI/CD";

/// A tracking-system engagement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngagementRef {
    /// Tracker-assigned id.
    pub id: u64,
    /// Engagement name.
    pub name: String,
}

/// Body of `POST /engagements/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementRequest {
    /// Deterministic engagement name.
    pub name: String,
    /// First day of the engagement.
    pub target_start: NaiveDate,
    /// Last day of the engagement.
    pub target_end: NaiveDate,
    /// Product the engagement belongs to.
    pub product: u64,
    /// Engagement status.
    pub status: String,
    /// Engagement type.
    pub engagement_type: String,
}

impl EngagementRequest {
    /// Builds the request for a run's engagement.
    #[must_use]
    pub fn for_run(identity: &RunIdentity, product: u64, today: NaiveDate) -> Self {
        Self {
            name: identity.engagement_name(),
            target_start: today,
            target_end: today,
            product,
            status: ENGAGEMENT_STATUS.to_string(),
            engagement_type: ENGAGEMENT_TYPE.to_string(),
        }
    }
}

/// Fields of `POST /import-scan/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportScanRequest {
    /// Scan type.
    pub scan_type: ScanType,
    /// Product name.
    pub product_name: String,
    /// Engagement the findings attach to.
    pub engagement_name: String,
    /// File name reported to the tracker.
    pub file_name: String,
    /// Artifact bytes.
    pub payload: Vec<u8>,
    /// Mark imported findings active.
    pub active: bool,
    /// Mark imported findings verified.
    pub verified: bool,
}

/// Tracker answer to an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportScanResponse {
    /// Id of the test record the import created.
    pub test_id: Option<u64>,
}

/// Outcome of publishing one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Engagement the artifact was attached to.
    pub engagement: EngagementRef,
    /// Scan type uploaded.
    pub scan_type: ScanType,
    /// Uploaded file name.
    pub file_name: String,
    /// Test record id, when the tracker reports one.
    pub test_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EngagementPage {
    #[serde(default)]
    pub results: Vec<EngagementRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engagement_request_for_run() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let req = EngagementRequest::for_run(&RunIdentity::new("abc", 42), 7, today);
        assert_eq!(req.name, "CI/CD Build 42");
        assert_eq!(req.product, 7);

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["target_start"], "2026-03-01");
        assert_eq!(json["engagement_type"], "CI/CD");
        assert_eq!(json["status"], "In Progress");
    }

    #[test]
    fn test_engagement_page_decode() {
        let page: EngagementPage = serde_json::from_str(
            r#"{"count": 1, "results": [{"id": 3, "name": "CI/CD Build 1", "extra": true}]}"#,
        )
        .unwrap();
        assert_eq!(page.results[0].id, 3);
    }
}
