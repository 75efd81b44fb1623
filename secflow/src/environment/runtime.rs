//! Container runtime adapter.

use super::spec::{RestartPolicy, Retention, ServiceSpec, ENVIRONMENT_LABEL, RETENTION_LABEL};
use crate::errors::{truncate_body, EnvironmentError};
use crate::tools::{ToolInvocation, ToolOutcome, ToolRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container name.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Whether the container is running.
    pub running: bool,
    /// Health check verdict, if the image defines one.
    pub healthy: Option<bool>,
    /// Restart policy currently applied.
    pub restart_policy: RestartPolicy,
    /// Retention class read from the resource label.
    pub retention: Option<Retention>,
    /// Owning environment read from the resource label.
    pub environment: Option<String>,
}

impl ContainerState {
    /// True unless the resource is positively labelled transient.
    ///
    /// Unlabelled resources are treated as persistent so that pruning never
    /// removes something it cannot classify.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.retention != Some(Retention::Transient)
    }
}

/// Operations the lifecycle manager needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Returns the state of a container, or `None` if it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EnvironmentError>;

    /// Creates (without starting) a container for a service.
    async fn create(
        &self,
        environment: &str,
        network: Option<&str>,
        service: &ServiceSpec,
    ) -> Result<(), EnvironmentError>;

    /// Starts a stopped container.
    async fn start(&self, name: &str) -> Result<(), EnvironmentError>;

    /// Changes a container's restart policy in place.
    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), EnvironmentError>;

    /// Force-removes a container.
    async fn remove(&self, name: &str) -> Result<(), EnvironmentError>;

    /// Lists every container labelled with the environment's name.
    async fn list(&self, environment: &str) -> Result<Vec<ContainerState>, EnvironmentError>;

    /// Creates a network if absent. Returns true if it was created.
    async fn ensure_network(&self, environment: &str, name: &str)
        -> Result<bool, EnvironmentError>;

    /// Removes dangling images.
    async fn prune_images(&self) -> Result<(), EnvironmentError>;
}

/// Drives the `docker` CLI through a [`ToolRunner`].
#[derive(Debug, Clone)]
pub struct DockerCli {
    runner: Arc<dyn ToolRunner>,
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    /// Creates an adapter using the `docker` binary on `PATH`.
    #[must_use]
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            binary: "docker".to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Uses a different CLI binary (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exec(&self, args: Vec<String>) -> Result<ToolOutcome, EnvironmentError> {
        let invocation = ToolInvocation::new(&self.binary)
            .args(args)
            .timeout(self.timeout);
        Ok(self.runner.run(&invocation).await?)
    }

    async fn exec_checked(
        &self,
        operation: &str,
        resource: &str,
        args: Vec<String>,
    ) -> Result<ToolOutcome, EnvironmentError> {
        let outcome = self.exec(args).await?;
        if outcome.success() {
            Ok(outcome)
        } else {
            Err(EnvironmentError::runtime(
                operation,
                resource,
                truncate_body(outcome.stderr.trim()),
            ))
        }
    }

    /// Builds the `create` argument list for a service.
    #[must_use]
    pub fn create_args(environment: &str, network: Option<&str>, service: &ServiceSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            service.name.clone(),
            "--restart".to_string(),
            service.restart_policy.as_str().to_string(),
            "--label".to_string(),
            format!("{ENVIRONMENT_LABEL}={environment}"),
            "--label".to_string(),
            format!("{RETENTION_LABEL}={}", service.retention),
        ];
        if let Some(network) = network {
            args.push("--network".to_string());
            args.push(network.to_string());
        }
        for port in &service.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for (key, value) in &service.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for volume in &service.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        args.push(service.image_ref());
        args
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    name: String,
    config: InspectConfig,
    state: InspectState,
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    restart_policy: InspectRestartPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    name: String,
}

/// Parses `docker inspect` output for a single container.
///
/// # Errors
///
/// Returns [`EnvironmentError::Decode`] if the JSON does not have the
/// expected shape.
pub fn parse_inspect(resource: &str, json: &str) -> Result<Option<ContainerState>, EnvironmentError> {
    let records: Vec<InspectRecord> =
        serde_json::from_str(json).map_err(|e| EnvironmentError::Decode {
            resource: resource.to_string(),
            message: e.to_string(),
        })?;

    let Some(record) = records.into_iter().next() else {
        return Ok(None);
    };

    let labels = record.config.labels.unwrap_or_default();
    let restart_policy =
        RestartPolicy::parse(&record.host_config.restart_policy.name).ok_or_else(|| {
            EnvironmentError::Decode {
                resource: resource.to_string(),
                message: format!(
                    "unknown restart policy '{}'",
                    record.host_config.restart_policy.name
                ),
            }
        })?;

    Ok(Some(ContainerState {
        name: record.name.trim_start_matches('/').to_string(),
        image: record.config.image,
        running: record.state.running,
        healthy: record.state.health.map(|h| h.status == "healthy"),
        restart_policy,
        retention: labels.get(RETENTION_LABEL).and_then(|v| Retention::parse(v)),
        environment: labels.get(ENVIRONMENT_LABEL).cloned(),
    }))
}

fn is_missing(outcome: &ToolOutcome) -> bool {
    let stderr = outcome.stderr.to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not found")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EnvironmentError> {
        let outcome = self
            .exec(vec![
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                name.to_string(),
            ])
            .await?;

        if !outcome.success() {
            if is_missing(&outcome) {
                return Ok(None);
            }
            return Err(EnvironmentError::runtime(
                "inspect",
                name,
                truncate_body(outcome.stderr.trim()),
            ));
        }

        parse_inspect(name, &outcome.stdout)
    }

    async fn create(
        &self,
        environment: &str,
        network: Option<&str>,
        service: &ServiceSpec,
    ) -> Result<(), EnvironmentError> {
        debug!(container = %service.name, image = %service.image_ref(), "Creating container");
        self.exec_checked(
            "create",
            &service.name,
            Self::create_args(environment, network, service),
        )
        .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), EnvironmentError> {
        self.exec_checked("start", name, vec!["start".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), EnvironmentError> {
        self.exec_checked(
            "update",
            name,
            vec![
                "update".to_string(),
                "--restart".to_string(),
                policy.as_str().to_string(),
                name.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EnvironmentError> {
        let outcome = self
            .exec(vec!["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        if outcome.success() || is_missing(&outcome) {
            Ok(())
        } else {
            Err(EnvironmentError::runtime(
                "rm",
                name,
                truncate_body(outcome.stderr.trim()),
            ))
        }
    }

    async fn list(&self, environment: &str) -> Result<Vec<ContainerState>, EnvironmentError> {
        let outcome = self
            .exec_checked(
                "ps",
                environment,
                vec![
                    "ps".to_string(),
                    "-a".to_string(),
                    "--filter".to_string(),
                    format!("label={ENVIRONMENT_LABEL}={environment}"),
                    "--format".to_string(),
                    "{{.Names}}".to_string(),
                ],
            )
            .await?;

        let mut states = Vec::new();
        for name in outcome.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(state) = self.inspect(name).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn ensure_network(
        &self,
        environment: &str,
        name: &str,
    ) -> Result<bool, EnvironmentError> {
        let existing = self
            .exec(vec![
                "network".to_string(),
                "inspect".to_string(),
                name.to_string(),
            ])
            .await?;
        if existing.success() {
            return Ok(false);
        }

        let created = self
            .exec(vec![
                "network".to_string(),
                "create".to_string(),
                "--label".to_string(),
                format!("{ENVIRONMENT_LABEL}={environment}"),
                name.to_string(),
            ])
            .await?;
        if created.success() {
            Ok(true)
        } else if created.stderr.contains("already exists") {
            // Another run created it between our inspect and create.
            Ok(false)
        } else {
            Err(EnvironmentError::runtime(
                "network create",
                name,
                truncate_body(created.stderr.trim()),
            ))
        }
    }

    async fn prune_images(&self) -> Result<(), EnvironmentError> {
        self.exec_checked(
            "image prune",
            "images",
            vec!["image".to_string(), "prune".to_string(), "-f".to_string()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedToolRunner;
    use pretty_assertions::assert_eq;

    const INSPECT_JSON: &str = r#"[{
        "Name": "/db",
        "Config": {
            "Image": "postgres:16",
            "Labels": {"secflow.environment": "ci", "secflow.retention": "persistent"}
        },
        "State": {"Running": true, "Health": {"Status": "healthy"}},
        "HostConfig": {"RestartPolicy": {"Name": "always"}}
    }]"#;

    #[test]
    fn test_parse_inspect() {
        let state = parse_inspect("db", INSPECT_JSON).unwrap().unwrap();
        assert_eq!(
            state,
            ContainerState {
                name: "db".to_string(),
                image: "postgres:16".to_string(),
                running: true,
                healthy: Some(true),
                restart_policy: RestartPolicy::Always,
                retention: Some(Retention::Persistent),
                environment: Some("ci".to_string()),
            }
        );
        assert!(state.is_protected());
    }

    #[test]
    fn test_parse_inspect_unlabelled_is_protected() {
        let json = r#"[{
            "Name": "/legacy",
            "Config": {"Image": "redis:7", "Labels": null},
            "State": {"Running": false},
            "HostConfig": {"RestartPolicy": {"Name": ""}}
        }]"#;
        let state = parse_inspect("legacy", json).unwrap().unwrap();
        assert_eq!(state.retention, None);
        assert_eq!(state.restart_policy, RestartPolicy::No);
        assert!(state.is_protected());
        assert!(parse_inspect("x", "[]").unwrap().is_none());
        assert!(parse_inspect("x", "not json").is_err());
    }

    #[test]
    fn test_create_args_carry_labels() {
        let service = ServiceSpec::new("sonarqube", "sonarqube", Retention::Transient)
            .with_version("lts")
            .with_port("9000:9000");
        let args = DockerCli::create_args("ci", Some("ci-net"), &service);

        assert_eq!(args.first().map(String::as_str), Some("create"));
        assert!(args.contains(&"secflow.environment=ci".to_string()));
        assert!(args.contains(&"secflow.retention=transient".to_string()));
        assert!(args.contains(&"unless-stopped".to_string()));
        assert!(args.contains(&"ci-net".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("sonarqube:lts"));
    }

    #[tokio::test]
    async fn test_inspect_missing_container() {
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("docker inspect", ToolOutcome::exited(1, "[]", "Error: No such container: db"));
        let docker = DockerCli::new(runner.clone());

        assert!(docker.inspect("db").await.unwrap().is_none());
        assert_eq!(runner.calls(), vec!["docker inspect --type container db"]);
    }

    #[tokio::test]
    async fn test_ensure_network_idempotent() {
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("docker network inspect", ToolOutcome::exited(0, "[{}]", ""));
        let docker = DockerCli::new(runner.clone());

        assert!(!docker.ensure_network("ci", "ci-net").await.unwrap());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_network_tolerates_race() {
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("docker network inspect", ToolOutcome::exited(1, "", "not found"));
        runner.respond(
            "docker network create",
            ToolOutcome::exited(1, "", "network with name ci-net already exists"),
        );
        let docker = DockerCli::new(runner);

        assert!(!docker.ensure_network("ci", "ci-net").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_start_is_runtime_error() {
        let runner = Arc::new(ScriptedToolRunner::new());
        runner.respond("docker start", ToolOutcome::exited(1, "", "port is already allocated"));
        let docker = DockerCli::new(runner);

        let err = docker.start("sonarqube").await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));
    }
}
