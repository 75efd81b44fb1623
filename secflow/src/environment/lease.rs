//! Exclusive use of a named environment across concurrent runs.

use crate::context::RunIdentity;
use crate::errors::EnvironmentError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Grants exclusive leases on environments.
///
/// Leases are tracked in-process; when a lock directory is configured they
/// are also visible to other orchestrator processes on the same host
/// through lock files created with `create_new`.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLeases {
    held: Arc<DashMap<String, String>>,
    lock_dir: Option<PathBuf>,
}

impl EnvironmentLeases {
    /// Creates an in-process lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also coordinates through lock files in `dir`.
    #[must_use]
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// Returns the lock file used for an environment, if any.
    #[must_use]
    pub fn lock_path(&self, environment: &str) -> Option<PathBuf> {
        self.lock_dir
            .as_deref()
            .map(|dir| lock_file_path(dir, environment))
    }

    /// Returns who holds an environment, if anyone in this process does.
    #[must_use]
    pub fn holder(&self, environment: &str) -> Option<String> {
        self.held.get(environment).map(|h| h.value().clone())
    }

    /// True if `identity`'s run holds the environment in this process.
    #[must_use]
    pub fn is_held_by(&self, environment: &str, identity: &RunIdentity) -> bool {
        self.held
            .get(environment)
            .is_some_and(|h| *h.value() == holder_for(identity))
    }

    /// Acquires exclusive use of an environment for a run.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Conflict`] naming the current holder if
    /// the environment is already leased.
    pub fn try_acquire(
        &self,
        environment: &str,
        identity: &RunIdentity,
    ) -> Result<EnvironmentLease, EnvironmentError> {
        let holder = holder_for(identity);

        match self.held.entry(environment.to_string()) {
            Entry::Occupied(existing) => Err(EnvironmentError::Conflict {
                environment: environment.to_string(),
                holder: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let lock_file = match self.lock_path(environment) {
                    Some(path) => {
                        create_lock_file(&path, environment, &holder)?;
                        Some(path)
                    }
                    None => None,
                };
                slot.insert(holder.clone());
                debug!(environment = %environment, holder = %holder, "Environment lease acquired");

                Ok(EnvironmentLease {
                    environment: environment.to_string(),
                    holder,
                    lock_file,
                    table: Arc::clone(&self.held),
                })
            }
        }
    }
}

fn holder_for(identity: &RunIdentity) -> String {
    format!("{identity} [run {}]", identity.run_id)
}

/// Exclusive use of one environment. Released on drop.
#[derive(Debug)]
pub struct EnvironmentLease {
    environment: String,
    holder: String,
    lock_file: Option<PathBuf>,
    table: Arc<DashMap<String, String>>,
}

impl EnvironmentLease {
    /// Returns the leased environment's name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the holder description.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_file {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(
                    environment = %self.environment,
                    path = %path.display(),
                    error = %e,
                    "Could not remove environment lock file"
                );
            }
        }
        self.table.remove(&self.environment);
        debug!(environment = %self.environment, "Environment lease released");
    }
}

fn lock_file_path(dir: &Path, environment: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(environment.as_bytes()));
    dir.join(format!("env-{}.lock", &digest[..16]))
}

fn create_lock_file(path: &Path, environment: &str, holder: &str) -> Result<(), EnvironmentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            EnvironmentError::runtime("create lock dir", environment, e.to_string())
        })?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(holder.as_bytes()).map_err(|e| {
                EnvironmentError::runtime("write lock file", environment, e.to_string())
            })?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = std::fs::read_to_string(path)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("another process (lock file {})", path.display()));
            Err(EnvironmentError::Conflict {
                environment: environment.to_string(),
                holder: existing,
            })
        }
        Err(e) => Err(EnvironmentError::runtime(
            "create lock file",
            environment,
            e.to_string(),
        )),
    }
}
