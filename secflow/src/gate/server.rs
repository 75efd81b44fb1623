//! Analysis server API.
//!
//! A scanner submission is processed asynchronously by the server's
//! compute engine. The scanner writes the engine task id to a report-task
//! file; the task, once finished, names the analysis whose gate status
//! belongs to this run.

use super::AnalysisVerdict;
use crate::errors::{truncate_body, GateError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

const TASK_PATH: &str = "/api/ce/task";
const PROJECT_STATUS_PATH: &str = "/api/qualitygates/project_status";

/// State of a compute-engine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Queued.
    Pending,
    /// Being processed.
    InProgress,
    /// Finished; the analysis is available.
    Success,
    /// Processing failed.
    Failed,
    /// Cancelled on the server.
    Canceled,
}

impl TaskStatus {
    /// True while the task may still change.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// A compute-engine task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    /// Task state.
    pub status: TaskStatus,
    /// Analysis produced by the task, once it succeeded.
    #[serde(default)]
    pub analysis_id: Option<String>,
}

impl AnalysisTask {
    /// A task that has not finished yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            analysis_id: None,
        }
    }

    /// A finished task that produced `analysis_id`.
    #[must_use]
    pub fn succeeded(analysis_id: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            analysis_id: Some(analysis_id.into()),
        }
    }
}

/// Contents of the scanner's report-task file that matter here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTask {
    /// Project the submission was for.
    pub project_key: Option<String>,
    /// Compute-engine task id.
    pub task_id: String,
}

/// Parses a `key=value` report-task file.
///
/// # Errors
///
/// Returns [`GateError::ReportTask`] if no `ceTaskId` is present.
pub fn parse_report_task(text: &str) -> Result<ReportTask, GateError> {
    let mut project_key = None;
    let mut task_id = None;
    for line in text.lines() {
        match line.trim().split_once('=') {
            Some(("ceTaskId", value)) if !value.trim().is_empty() => {
                task_id = Some(value.trim().to_string());
            }
            Some(("projectKey", value)) => project_key = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let task_id = task_id.ok_or_else(|| GateError::ReportTask("no ceTaskId entry".to_string()))?;
    Ok(ReportTask {
        project_key,
        task_id,
    })
}

/// Reads and parses the report-task file at `path`.
///
/// # Errors
///
/// Returns [`GateError::ReportTask`] if the file cannot be read or parsed.
pub async fn read_report_task(path: &Path) -> Result<ReportTask, GateError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GateError::ReportTask(format!("{}: {e}", path.display())))?;
    parse_report_task(&text)
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: AnalysisTask,
}

/// Decodes a `GET /api/ce/task` body.
///
/// # Errors
///
/// Returns [`GateError::Decode`] for malformed bodies or unknown states.
pub fn parse_task(body: &str) -> Result<AnalysisTask, GateError> {
    let response: TaskResponse =
        serde_json::from_str(body).map_err(|e| GateError::Decode(e.to_string()))?;
    Ok(response.task)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusResponse {
    project_status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: String,
}

/// Maps a project-status body to a final verdict, or `None` while the
/// analysis has no gate status yet.
///
/// # Errors
///
/// Returns [`GateError::Decode`] for malformed bodies or unknown statuses.
pub fn parse_project_status(body: &str) -> Result<Option<AnalysisVerdict>, GateError> {
    let response: ProjectStatusResponse =
        serde_json::from_str(body).map_err(|e| GateError::Decode(e.to_string()))?;
    match response.project_status.status.as_str() {
        "OK" | "WARN" => Ok(Some(AnalysisVerdict::Passed)),
        "ERROR" => Ok(Some(AnalysisVerdict::Failed)),
        "NONE" => Ok(None),
        other => Err(GateError::Decode(format!("unknown gate status '{other}'"))),
    }
}

/// Queries the analysis server needs to answer for one run.
///
/// The token, when the server requires one, is passed per call.
#[async_trait]
pub trait AnalysisServer: Send + Sync + Debug {
    /// Fetches a compute-engine task.
    async fn task(
        &self,
        task_id: &str,
        token: Option<&SecretString>,
    ) -> Result<AnalysisTask, GateError>;

    /// Fetches the gate status of one analysis.
    async fn project_status(
        &self,
        analysis_id: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<AnalysisVerdict>, GateError>;
}

/// [`AnalysisServer`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAnalysisServer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalysisServer {
    /// Creates a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GateError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Returns the URL of an API path.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: Option<&SecretString>,
    ) -> Result<String, GateError> {
        let mut request = self.client.get(self.url(path)).query(query);
        if let Some(token) = token {
            // The analysis server takes the token as the basic-auth user.
            request = request.basic_auth(token.expose_secret(), Some(""));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GateError::Transport(e.without_url().to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GateError::Transport(e.without_url().to_string()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(GateError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            })
        }
    }
}

#[async_trait]
impl AnalysisServer for HttpAnalysisServer {
    async fn task(
        &self,
        task_id: &str,
        token: Option<&SecretString>,
    ) -> Result<AnalysisTask, GateError> {
        let body = self.get(TASK_PATH, &[("id", task_id)], token).await?;
        parse_task(&body)
    }

    async fn project_status(
        &self,
        analysis_id: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<AnalysisVerdict>, GateError> {
        let body = self
            .get(PROJECT_STATUS_PATH, &[("analysisId", analysis_id)], token)
            .await?;
        parse_project_status(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_project_status() {
        let ok = r#"{"projectStatus": {"status": "OK", "conditions": []}}"#;
        let err = r#"{"projectStatus": {"status": "ERROR"}}"#;
        let none = r#"{"projectStatus": {"status": "NONE"}}"#;

        assert_eq!(parse_project_status(ok).unwrap(), Some(AnalysisVerdict::Passed));
        assert_eq!(parse_project_status(err).unwrap(), Some(AnalysisVerdict::Failed));
        assert_eq!(parse_project_status(none).unwrap(), None);
        assert!(parse_project_status(r#"{"projectStatus": {"status": "??"}}"#).is_err());
        assert!(parse_project_status("<html>").is_err());
    }

    #[test]
    fn test_parse_task() {
        let done = r#"{"task": {"id": "AYx1", "status": "SUCCESS", "analysisId": "AYa9"}}"#;
        assert_eq!(parse_task(done).unwrap(), AnalysisTask::succeeded("AYa9"));

        let queued = r#"{"task": {"id": "AYx1", "status": "PENDING"}}"#;
        let task = parse_task(queued).unwrap();
        assert!(task.status.is_pending());
        assert!(task.analysis_id.is_none());

        let running = r#"{"task": {"id": "AYx1", "status": "IN_PROGRESS"}}"#;
        assert!(parse_task(running).unwrap().status.is_pending());
        let failed = r#"{"task": {"id": "AYx1", "status": "FAILED"}}"#;
        assert_eq!(parse_task(failed).unwrap().status, TaskStatus::Failed);
        assert!(parse_task(r#"{"task": {"status": "LOST"}}"#).is_err());
    }

    #[test]
    fn test_parse_report_task() {
        let text = "projectKey=app\nserverUrl=http://sonar:9000\nceTaskId=AYx1\n\
                    ceTaskUrl=http://sonar:9000/api/ce/task?id=AYx1\n";
        let report = parse_report_task(text).unwrap();
        assert_eq!(report.task_id, "AYx1");
        assert_eq!(report.project_key.as_deref(), Some("app"));

        assert!(matches!(
            parse_report_task("projectKey=app\nceTaskId=\n"),
            Err(GateError::ReportTask(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_report_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_report_task(&dir.path().join("report-task.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::ReportTask(_)));
    }

    #[test]
    fn test_urls() {
        let server = HttpAnalysisServer::new("http://sonar:9000/", Duration::from_secs(1)).unwrap();
        assert_eq!(server.url(TASK_PATH), "http://sonar:9000/api/ce/task");
        assert_eq!(
            server.url(PROJECT_STATUS_PATH),
            "http://sonar:9000/api/qualitygates/project_status"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let server = HttpAnalysisServer::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            server.task("AYx1", None).await,
            Err(GateError::Transport(_))
        ));
    }
}
