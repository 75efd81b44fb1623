//! Declarative environment specification.

use crate::errors::EnvironmentError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Characters the container runtime accepts in container and network names.
const RESOURCE_NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$";

/// Label carrying the owning environment's name.
pub const ENVIRONMENT_LABEL: &str = "secflow.environment";

/// Label carrying a resource's retention class.
pub const RETENTION_LABEL: &str = "secflow.retention";

/// Restart policy applied by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    No,
    /// Always restart, including on host boot.
    Always,
    /// Restart unless explicitly stopped; also starts on host boot.
    #[default]
    UnlessStopped,
    /// Restart only after a non-zero exit.
    OnFailure,
}

impl RestartPolicy {
    /// Returns the runtime's name for this policy.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }

    /// Parses the runtime's name for a policy. Empty means `no`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "no" => Some(Self::No),
            "always" => Some(Self::Always),
            "unless-stopped" => Some(Self::UnlessStopped),
            "on-failure" => Some(Self::OnFailure),
            _ => None,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a resource survives pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Holds state that must survive every run and every prune.
    Persistent,
    /// Safe to reclaim between or after runs.
    Transient,
}

impl Retention {
    /// Returns the label value for this class.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Transient => "transient",
        }
    }

    /// Parses a label value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "persistent" => Some(Self::Persistent),
            "transient" => Some(Self::Transient),
            _ => None,
        }
    }

    /// True for persistent resources.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent)
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_version() -> String {
    "latest".to_string()
}

/// One declared service of an environment.
///
/// `retention` has no default: every resource must be classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Stable container name.
    pub name: String,
    /// Image repository.
    pub image: String,
    /// Image tag.
    #[serde(default = "default_version")]
    pub version: String,
    /// Declared restart policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Retention class.
    pub retention: Retention,
    /// Published ports, in runtime syntax (`9000:9000`).
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Volume mounts, in runtime syntax (`data:/var/lib/postgresql`).
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl ServiceSpec {
    /// Creates a service spec with the default version and restart policy.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>, retention: Retention) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            version: default_version(),
            restart_policy: RestartPolicy::default(),
            retention,
            ports: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
        }
    }

    /// Sets the image tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the restart policy.
    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Adds a published port.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.ports.push(port.into());
        self
    }

    /// Adds a volume mount.
    #[must_use]
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Full image reference, `image:version`.
    #[must_use]
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// A named set of long-lived service resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Stable environment name; leases are keyed by it.
    pub name: String,
    /// Shared network the services join.
    #[serde(default)]
    pub network: Option<String>,
    /// Declared services.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl EnvironmentSpec {
    /// Creates an environment without services.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: None,
            services: Vec::new(),
        }
    }

    /// Sets the shared network.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Adds a service.
    #[must_use]
    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    /// Returns a declared service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// True if `name` is a service declared persistent.
    #[must_use]
    pub fn declares_persistent(&self, name: &str) -> bool {
        self.service(name)
            .is_some_and(|s| s.retention.is_persistent())
    }

    /// Checks names and uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::InvalidName`] for the first bad or
    /// duplicated name.
    pub fn validate(&self) -> Result<(), EnvironmentError> {
        validate_resource_name(&self.name)?;
        if let Some(network) = &self.network {
            validate_resource_name(network)?;
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            validate_resource_name(&service.name)?;
            if !seen.insert(service.name.as_str()) {
                return Err(EnvironmentError::InvalidName {
                    name: format!("{} (declared twice)", service.name),
                });
            }
        }
        Ok(())
    }
}

/// Checks a container or network name against the runtime's rules.
///
/// # Errors
///
/// Returns [`EnvironmentError::InvalidName`] if the name is not acceptable.
pub fn validate_resource_name(name: &str) -> Result<(), EnvironmentError> {
    let invalid = || EnvironmentError::InvalidName {
        name: name.to_string(),
    };
    let pattern = Regex::new(RESOURCE_NAME_PATTERN).map_err(|_| invalid())?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(invalid())
    }
}
