//! Pipeline configuration loaded from TOML.
//!
//! Secrets never appear here; fields ending in `_secret` name a credential
//! that the [`CredentialBroker`](crate::credentials::CredentialBroker)
//! resolves at run time.

use crate::cleanup::WorkspaceRetention;
use crate::environment::EnvironmentSpec;
use crate::errors::ConfigError;
use crate::tracker::{RetryPolicy, DEFAULT_TOKEN_SECRET};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_pipeline_name() -> String {
    "devsecops".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_run_timeout_secs() -> u64 {
    3600
}

fn default_gate_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_report_task() -> String {
    ".scannerwork/report-task.txt".to_string()
}

fn default_auth_scheme() -> String {
    "Bearer".to_string()
}

fn default_tracker_token_secret() -> String {
    DEFAULT_TOKEN_SECRET.to_string()
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_step_timeout_secs() -> u64 {
    120
}

/// Root of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run-wide settings.
    #[serde(default)]
    pub run: RunConfig,
    /// Supporting service environment.
    pub environment: EnvironmentSpec,
    /// Quality gate.
    #[serde(default)]
    pub gate: GateConfig,
    /// Findings tracker.
    pub tracker: TrackerConfig,
    /// External tool stages.
    pub stages: StagesConfig,
    /// Post-run reclamation.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Pipeline name reported in the run record.
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    /// Workspace root; scratch and log directories live below it.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Budget for all stages together.
    #[serde(default = "default_run_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory for cross-process environment lock files.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pipeline_name: default_pipeline_name(),
            workspace: default_workspace(),
            timeout_secs: default_run_timeout_secs(),
            lock_dir: None,
        }
    }
}

impl RunConfig {
    /// Run budget as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[gate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Analysis server base URL; without it verdicts must be posted externally.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Project key on the analysis server.
    #[serde(default)]
    pub project_key: Option<String>,
    /// Credential holding the analysis server token.
    #[serde(default)]
    pub token_secret: Option<String>,
    /// How long to wait for a verdict.
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between status polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Timeout of each status request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Report file the scanner writes after submitting, relative to the
    /// workspace. Its `ceTaskId` ties the verdict to this run's analysis.
    #[serde(default = "default_report_task")]
    pub report_task: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            project_key: None,
            token_secret: None,
            timeout_secs: default_gate_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            report_task: default_report_task(),
        }
    }
}

impl GateConfig {
    /// Verdict wait as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[tracker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// API base URL, e.g. `https://tracker.example/api/v2`.
    pub base_url: String,
    /// Product id engagements are created under.
    pub product_id: u64,
    /// Product name sent with uploads.
    pub product_name: String,
    /// Credential holding the API token.
    #[serde(default = "default_tracker_token_secret")]
    pub token_secret: String,
    /// Authorization scheme placed before the token.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    /// Timeout of each request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// One external tool stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Program to run.
    pub program: String,
    /// Argument templates; `{revision}`, `{build_number}`, `{workspace}` and
    /// `{scratch}` are expanded.
    #[serde(default)]
    pub args: Vec<String>,
    /// Stage and process timeout.
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
    /// Non-zero exit codes that still count as success.
    #[serde(default)]
    pub accept_exit_codes: Vec<i32>,
    /// Path of the produced scan artifact.
    #[serde(default)]
    pub artifact: Option<String>,
    /// Plain environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variable name to credential name.
    #[serde(default)]
    pub secret_env: BTreeMap<String, String>,
}

impl CommandConfig {
    /// Creates a command with default settings.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: default_command_timeout_secs(),
            accept_exit_codes: Vec::new(),
            artifact: None,
            env: BTreeMap::new(),
            secret_env: BTreeMap::new(),
        }
    }

    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[stages.*]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Compile and bundle.
    pub build: CommandConfig,
    /// Static analysis submission.
    pub analyze: CommandConfig,
    /// Image packaging.
    pub package: CommandConfig,
    /// Dependency and image scan.
    #[serde(default)]
    pub image_scan: Option<CommandConfig>,
    /// Deployment to the target environment.
    pub deploy: CommandConfig,
    /// Dynamic scan against the deployment.
    #[serde(default)]
    pub dynamic_scan: Option<CommandConfig>,
}

impl StagesConfig {
    fn named(&self) -> Vec<(&'static str, &CommandConfig)> {
        let mut named = vec![
            ("build", &self.build),
            ("analyze", &self.analyze),
            ("package", &self.package),
            ("deploy", &self.deploy),
        ];
        if let Some(scan) = &self.image_scan {
            named.push(("image_scan", scan));
        }
        if let Some(scan) = &self.dynamic_scan {
            named.push(("dynamic_scan", scan));
        }
        named
    }
}

/// `[cleanup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Timeout of each cleanup step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Build-cache trim command, program first.
    #[serde(default)]
    pub cache_trim: Vec<String>,
    /// When the run's scratch directory is removed.
    #[serde(default)]
    pub workspace_retention: WorkspaceRetention,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            cache_trim: Vec::new(),
            workspace_retention: WorkspaceRetention::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or validated.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.run.pipeline_name.trim().is_empty() {
            return invalid("run.pipeline_name is empty".to_string());
        }
        if self.run.timeout_secs == 0 {
            return invalid("run.timeout_secs must be positive".to_string());
        }

        self.environment
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("environment: {e}")))?;

        if self.gate.timeout_secs == 0 || self.gate.poll_interval_secs == 0 {
            return invalid("gate timeouts must be positive".to_string());
        }
        if self.gate.server_url.is_some() && self.gate.project_key.is_none() {
            return invalid("gate.project_key is required with gate.server_url".to_string());
        }

        if self.tracker.base_url.trim().is_empty() {
            return invalid("tracker.base_url is empty".to_string());
        }
        if self.tracker.product_name.trim().is_empty() {
            return invalid("tracker.product_name is empty".to_string());
        }
        if self.tracker.token_secret.trim().is_empty() {
            return invalid("tracker.token_secret is empty".to_string());
        }
        if self.tracker.request_timeout_secs == 0 || self.tracker.retry.max_attempts == 0 {
            return invalid("tracker timeouts and attempts must be positive".to_string());
        }

        for (name, command) in self.stages.named() {
            if command.program.trim().is_empty() {
                return invalid(format!("stages.{name}.program is empty"));
            }
            if command.timeout_secs == 0 {
                return invalid(format!("stages.{name}.timeout_secs must be positive"));
            }
        }

        if self.cleanup.step_timeout_secs == 0 {
            return invalid("cleanup.step_timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{RestartPolicy, Retention};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[run]
workspace = "/srv/ci"
timeout_secs = 1800

[environment]
name = "ci"
network = "ci-net"

[[environment.services]]
name = "db"
image = "postgres"
version = "16"
restart_policy = "always"
retention = "persistent"
volumes = ["pgdata:/var/lib/postgresql/data"]

[[environment.services]]
name = "sonarqube"
image = "sonarqube"
version = "lts"
retention = "transient"
ports = ["9000:9000"]

[gate]
server_url = "http://localhost:9000"
project_key = "app"
token_secret = "sonar_token"

[tracker]
base_url = "https://tracker.example/api/v2"
product_id = 3
product_name = "app"

[stages.build]
program = "npm"
args = ["run", "build"]

[stages.analyze]
program = "sonar-scanner"
args = ["-Dsonar.projectVersion={build_number}"]
secret_env = { SONAR_TOKEN = "sonar_token" }

[stages.package]
program = "docker"
args = ["build", "-t", "app:{build_number}", "."]

[stages.image_scan]
program = "trivy"
args = ["image", "--format", "json", "-o", "{scratch}/trivy.json", "app:{build_number}"]
accept_exit_codes = [1]
artifact = "{scratch}/trivy.json"

[stages.deploy]
program = "docker"
args = ["compose", "up", "-d"]

[cleanup]
cache_trim = ["docker", "builder", "prune", "-f"]
workspace_retention = "keep_on_failure"
"#;

    #[test]
    fn test_parse_sample() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.run.workspace, PathBuf::from("/srv/ci"));
        assert_eq!(config.run.timeout(), Duration::from_secs(1800));
        assert_eq!(config.run.pipeline_name, "devsecops");
        assert_eq!(config.environment.services.len(), 2);

        let db = config.environment.service("db").unwrap();
        assert_eq!(db.retention, Retention::Persistent);
        assert_eq!(db.restart_policy, RestartPolicy::Always);
        let sonar = config.environment.service("sonarqube").unwrap();
        assert_eq!(sonar.restart_policy, RestartPolicy::UnlessStopped);

        assert_eq!(config.gate.timeout_secs, 300);
        assert_eq!(config.tracker.auth_scheme, "Bearer");
        assert_eq!(config.tracker.retry, RetryPolicy::default());
        assert_eq!(
            config.stages.analyze.secret_env.get("SONAR_TOKEN").map(String::as_str),
            Some("sonar_token")
        );
        assert_eq!(config.stages.image_scan.as_ref().unwrap().accept_exit_codes, vec![1]);
        assert!(config.stages.dynamic_scan.is_none());
        assert_eq!(config.cleanup.cache_trim.len(), 4);
        assert_eq!(
            config.cleanup.workspace_retention,
            WorkspaceRetention::KeepOnFailure
        );
        assert_eq!(config.gate.report_task, ".scannerwork/report-task.txt");
    }

    #[test]
    fn test_workspace_retention_defaults_to_remove() {
        let text = SAMPLE.replace("workspace_retention = \"keep_on_failure\"\n", "");
        let config = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.cleanup.workspace_retention, WorkspaceRetention::Remove);
    }

    #[test]
    fn test_service_without_retention_rejected() {
        let text = SAMPLE.replace("retention = \"transient\"\n", "");
        assert!(matches!(
            PipelineConfig::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let text = SAMPLE.replace("name = \"sonarqube\"", "name = \"db\"");
        assert!(matches!(
            PipelineConfig::from_toml_str(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let text = SAMPLE.replace("timeout_secs = 1800", "timeout_secs = 0");
        assert!(matches!(
            PipelineConfig::from_toml_str(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_gate_server_requires_project() {
        let text = SAMPLE.replace("project_key = \"app\"\n", "");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipelineConfig::load("/nonexistent/secflow.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secflow.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert!(PipelineConfig::load(&path).is_ok());
    }
}
