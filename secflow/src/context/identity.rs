//! Run identity supplied by the trigger.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a pipeline run.
///
/// The build number is monotonically increasing and, together with the
/// source revision, is supplied at trigger time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Unique ID for this execution (distinguishes re-triggers of a build).
    pub run_id: Uuid,
    /// Monotonically increasing build number.
    pub build_number: u64,
    /// Source revision being built.
    pub revision: String,
}

impl RunIdentity {
    /// Creates a run identity with a generated run ID.
    #[must_use]
    pub fn new(revision: impl Into<String>, build_number: u64) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            build_number,
            revision: revision.into(),
        }
    }

    /// Creates a run identity with a specific run ID.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Deterministic tracker engagement name for this build.
    #[must_use]
    pub fn engagement_name(&self) -> String {
        format!("CI/CD Build {}", self.build_number)
    }

    /// Key under which the analysis engine posts the gate verdict.
    #[must_use]
    pub fn verdict_key(&self) -> String {
        format!("{}#{}", self.revision, self.build_number)
    }

    /// First 12 characters of the revision, for tags and log lines.
    #[must_use]
    pub fn short_revision(&self) -> &str {
        let end = self
            .revision
            .char_indices()
            .nth(12)
            .map_or(self.revision.len(), |(i, _)| i);
        &self.revision[..end]
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {} ({})", self.build_number, self.short_revision())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engagement_name_is_deterministic() {
        let first = RunIdentity::new("deadbeef", 42);
        let retrigger = RunIdentity::new("deadbeef", 42);

        assert_ne!(first.run_id, retrigger.run_id);
        assert_eq!(first.engagement_name(), "CI/CD Build 42");
        assert_eq!(first.engagement_name(), retrigger.engagement_name());
    }

    #[test]
    fn test_verdict_key() {
        let identity = RunIdentity::new("abc", 3);
        assert_eq!(identity.verdict_key(), "abc#3");
    }

    #[test]
    fn test_short_revision() {
        let identity = RunIdentity::new("0123456789abcdef0123", 1);
        assert_eq!(identity.short_revision(), "0123456789ab");
        assert_eq!(RunIdentity::new("v1", 1).short_revision(), "v1");
        assert_eq!(identity.to_string(), "build 1 (0123456789ab)");
    }
}
