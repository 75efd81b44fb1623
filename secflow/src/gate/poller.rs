//! Polls the analysis server for the verdict of this run's analysis.

use super::server::{read_report_task, AnalysisServer, ReportTask, TaskStatus};
use super::{AnalysisVerdict, VerdictChannel};
use crate::cancellation::CancellationToken;
use crate::errors::GateError;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Follows one analysis submission to its gate status and posts the
/// verdict into a [`VerdictChannel`].
///
/// The submission is identified by the `ceTaskId` the scanner wrote to its
/// report-task file. Until that task has finished, the project's gate
/// status still describes an earlier analysis and is never consulted.
#[derive(Debug, Clone)]
pub struct AnalysisServerPoller {
    server: Arc<dyn AnalysisServer>,
    project_key: String,
    report_task: PathBuf,
    token_secret: Option<String>,
    interval: Duration,
}

impl AnalysisServerPoller {
    /// Creates a poller for `project_key` reading the task id from
    /// `report_task`, relative to the run workspace unless absolute.
    #[must_use]
    pub fn new(
        server: Arc<dyn AnalysisServer>,
        project_key: impl Into<String>,
        report_task: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server,
            project_key: project_key.into(),
            report_task: report_task.into(),
            token_secret: None,
            interval: Duration::from_secs(5),
        }
    }

    /// Authenticates with the token held by the named credential.
    #[must_use]
    pub fn with_token_secret(mut self, name: impl Into<String>) -> Self {
        self.token_secret = Some(name.into());
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Credential name of the server token, if one is needed.
    #[must_use]
    pub fn token_secret(&self) -> Option<&str> {
        self.token_secret.as_deref()
    }

    /// Path of the report-task file for a run in `workspace`.
    #[must_use]
    pub fn report_task_path(&self, workspace: &Path) -> PathBuf {
        if self.report_task.is_absolute() {
            self.report_task.clone()
        } else {
            workspace.join(&self.report_task)
        }
    }

    /// False if the report names a different project.
    fn owns(&self, report: &ReportTask) -> bool {
        report
            .project_key
            .as_deref()
            .map_or(true, |p| p == self.project_key)
    }

    /// Checks task `task_id` once and, if it has finished, the gate status
    /// of the analysis it produced.
    ///
    /// A task that failed or was cancelled on the server yields a failed
    /// verdict: the run's analysis will never be judged.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures, non-success statuses or
    /// undecodable bodies.
    pub async fn poll_once(
        &self,
        task_id: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<AnalysisVerdict>, GateError> {
        let task = self.server.task(task_id, token).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::InProgress => Ok(None),
            TaskStatus::Success => {
                let analysis = task.analysis_id.ok_or_else(|| {
                    GateError::Decode(format!("task {task_id} finished without an analysisId"))
                })?;
                self.server.project_status(&analysis, token).await
            }
            TaskStatus::Failed | TaskStatus::Canceled => {
                warn!(task = %task_id, status = ?task.status, "Analysis task did not complete");
                Ok(Some(AnalysisVerdict::Failed))
            }
        }
    }

    /// Polls in the background until a final verdict is posted for `key`
    /// or `cancel` fires. The task owns `token` and drops it when it ends.
    pub fn spawn(
        self,
        workspace: &Path,
        channel: Arc<VerdictChannel>,
        key: String,
        token: Option<SecretString>,
        cancel: Arc<CancellationToken>,
    ) -> JoinHandle<()> {
        let report_path = self.report_task_path(workspace);
        tokio::spawn(async move {
            let mut task_id: Option<String> = None;
            loop {
                if task_id.is_none() {
                    match read_report_task(&report_path).await {
                        Ok(report) if !self.owns(&report) => {
                            warn!(
                                expected = %self.project_key,
                                found = ?report.project_key,
                                "Report task belongs to another project"
                            );
                        }
                        Ok(report) => {
                            info!(project = %self.project_key, task = %report.task_id, "Following analysis task");
                            task_id = Some(report.task_id);
                        }
                        Err(e) => debug!(error = %e, "Analysis report task not available yet"),
                    }
                }

                if let Some(id) = &task_id {
                    match self.poll_once(id, token.as_ref()).await {
                        Ok(Some(verdict)) => {
                            channel.post(&key, verdict);
                            return;
                        }
                        Ok(None) => debug!(project = %self.project_key, task = %id, "Analysis still pending"),
                        Err(e) => warn!(project = %self.project_key, error = %e, "Gate poll failed"),
                    }
                }

                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {}
                    () = cancel.cancelled() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{AnalysisTask, HttpAnalysisServer};
    use crate::testing::ScriptedAnalysisServer;
    use pretty_assertions::assert_eq;

    fn poller(server: &Arc<ScriptedAnalysisServer>) -> AnalysisServerPoller {
        AnalysisServerPoller::new(server.clone(), "app", "report-task.txt")
            .with_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_previous_analysis_status_ignored_while_task_pending() {
        let server = Arc::new(ScriptedAnalysisServer::new());
        server.set_status("AX-previous", Some(AnalysisVerdict::Passed));
        server.set_status("AX-current", Some(AnalysisVerdict::Failed));
        server.push_task(AnalysisTask::pending());
        server.push_task(AnalysisTask::succeeded("AX-current"));
        let poller = poller(&server);

        assert_eq!(poller.poll_once("T1", None).await.unwrap(), None);
        assert!(server.status_queries().is_empty());

        assert_eq!(
            poller.poll_once("T1", None).await.unwrap(),
            Some(AnalysisVerdict::Failed)
        );
        assert_eq!(server.status_queries(), vec!["AX-current".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_task_fails_gate() {
        let server = Arc::new(ScriptedAnalysisServer::new());
        server.push_task(AnalysisTask {
            status: TaskStatus::Canceled,
            analysis_id: None,
        });
        assert_eq!(
            poller(&server).poll_once("T1", None).await.unwrap(),
            Some(AnalysisVerdict::Failed)
        );
    }

    #[tokio::test]
    async fn test_finished_task_without_analysis_is_decode_error() {
        let server = Arc::new(ScriptedAnalysisServer::new());
        server.push_task(AnalysisTask {
            status: TaskStatus::Success,
            analysis_id: None,
        });
        assert!(matches!(
            poller(&server).poll_once("T1", None).await,
            Err(GateError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_spawned_poller_follows_report_task() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ScriptedAnalysisServer::new());
        server.set_status("AX-7", Some(AnalysisVerdict::Passed));
        server.push_task(AnalysisTask::pending());
        server.push_task(AnalysisTask::succeeded("AX-7"));

        let channel = Arc::new(VerdictChannel::new());
        let rx = channel.subscribe("build-7");
        let handle = poller(&server).spawn(
            dir.path(),
            channel.clone(),
            "build-7".to_string(),
            Some(SecretString::from("sonar-token-7".to_string())),
            Arc::new(CancellationToken::new()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(server.task_queries().is_empty());
        std::fs::write(dir.path().join("report-task.txt"), "projectKey=app\nceTaskId=T7\n").unwrap();

        let verdict = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict, AnalysisVerdict::Passed);
        handle.await.unwrap();
        assert!(server.task_queries().iter().all(|t| t == "T7"));
        assert_eq!(server.tokens_seen(), vec!["sonar-token-7".to_string()]);
    }

    #[tokio::test]
    async fn test_report_task_of_other_project_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report-task.txt"), "projectKey=other\nceTaskId=T9\n").unwrap();
        let server = Arc::new(ScriptedAnalysisServer::new());
        let cancel = Arc::new(CancellationToken::new());
        let handle = poller(&server).spawn(
            dir.path(),
            Arc::new(VerdictChannel::new()),
            "k".to_string(),
            None,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel("done");
        handle.await.unwrap();
        assert!(server.task_queries().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_poller_stops_on_cancel() {
        let server: Arc<dyn AnalysisServer> =
            Arc::new(HttpAnalysisServer::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report-task.txt"), "ceTaskId=T1\n").unwrap();
        let poller = AnalysisServerPoller::new(server, "app", "report-task.txt")
            .with_interval(Duration::from_millis(10));
        let cancel = Arc::new(CancellationToken::new());
        let handle = poller.spawn(
            dir.path(),
            Arc::new(VerdictChannel::new()),
            "k".to_string(),
            None,
            cancel.clone(),
        );

        cancel.cancel("done");
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_report_task_path() {
        let server = Arc::new(ScriptedAnalysisServer::new());
        let relative = AnalysisServerPoller::new(server.clone(), "app", ".scannerwork/report-task.txt");
        assert_eq!(
            relative.report_task_path(Path::new("/srv/ci")),
            PathBuf::from("/srv/ci/.scannerwork/report-task.txt")
        );
        let absolute = AnalysisServerPoller::new(server, "app", "/tmp/report-task.txt");
        assert_eq!(
            absolute.report_task_path(Path::new("/srv/ci")),
            PathBuf::from("/tmp/report-task.txt")
        );
    }
}
