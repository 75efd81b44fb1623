//! Scan artifacts produced by scanning stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The fixed set of scan types the findings tracker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    /// Dependency and container image scan.
    DependencyScan,
    /// Dynamic application scan against the deployed target.
    DynamicScan,
    /// Static-analysis summary exported from the analysis server.
    StaticAnalysisSummary,
}

impl ScanType {
    /// The `scan_type` value sent to the tracker's import endpoint.
    #[must_use]
    pub fn tracker_name(&self) -> &'static str {
        match self {
            Self::DependencyScan => "Trivy Scan",
            Self::DynamicScan => "ZAP Scan",
            Self::StaticAnalysisSummary => "SonarQube Scan",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyScan => write!(f, "dependency_scan"),
            Self::DynamicScan => write!(f, "dynamic_scan"),
            Self::StaticAnalysisSummary => write!(f, "static_analysis_summary"),
        }
    }
}

/// Where the artifact content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactPayload {
    /// A report file written by the scanner.
    File {
        /// Path to the report.
        path: PathBuf,
    },
    /// An in-memory report.
    Inline {
        /// File name presented to the tracker.
        file_name: String,
        /// Report bytes.
        #[serde(skip)]
        bytes: Vec<u8>,
    },
}

/// A (scan type, payload) pair uploaded against one engagement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanArtifact {
    /// The scan type.
    pub scan_type: ScanType,
    /// The report content.
    pub payload: ArtifactPayload,
    /// Name of the stage that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
}

impl ScanArtifact {
    /// Creates an artifact backed by a report file.
    #[must_use]
    pub fn file(scan_type: ScanType, path: impl Into<PathBuf>) -> Self {
        Self {
            scan_type,
            payload: ArtifactPayload::File { path: path.into() },
            produced_by: None,
        }
    }

    /// Creates an artifact from in-memory bytes.
    #[must_use]
    pub fn inline(scan_type: ScanType, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            scan_type,
            payload: ArtifactPayload::Inline {
                file_name: file_name.into(),
                bytes,
            },
            produced_by: None,
        }
    }

    /// Records the producing stage.
    #[must_use]
    pub fn produced_by(mut self, stage: impl Into<String>) -> Self {
        self.produced_by = Some(stage.into());
        self
    }

    /// The file name presented to the tracker.
    #[must_use]
    pub fn file_name(&self) -> String {
        match &self.payload {
            ArtifactPayload::File { path } => path
                .file_name()
                .map_or_else(|| "report".to_string(), |n| n.to_string_lossy().into_owned()),
            ArtifactPayload::Inline { file_name, .. } => file_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_type_tracker_names() {
        assert_eq!(ScanType::DependencyScan.tracker_name(), "Trivy Scan");
        assert_eq!(ScanType::DynamicScan.tracker_name(), "ZAP Scan");
        assert_eq!(ScanType::StaticAnalysisSummary.tracker_name(), "SonarQube Scan");
    }

    #[test]
    fn test_artifact_file_name() {
        let artifact = ScanArtifact::file(ScanType::DependencyScan, "/tmp/reports/trivy.json");
        assert_eq!(artifact.file_name(), "trivy.json");

        let inline = ScanArtifact::inline(ScanType::DynamicScan, "zap.xml", b"<x/>".to_vec());
        assert_eq!(inline.file_name(), "zap.xml");
    }

    #[test]
    fn test_artifact_produced_by() {
        let artifact = ScanArtifact::file(ScanType::DynamicScan, "zap.xml").produced_by("dynamic-scan");
        assert_eq!(artifact.produced_by.as_deref(), Some("dynamic-scan"));
    }
}
