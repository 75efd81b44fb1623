//! In-memory stand-ins for the external systems a run talks to.

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::environment::{ContainerRuntime, ContainerState, RestartPolicy, ServiceSpec};
use crate::errors::{EnvironmentError, GateError, ToolError, TrackerError};
use crate::gate::{AnalysisServer, AnalysisTask, AnalysisVerdict};
use crate::tools::{ToolInvocation, ToolOutcome, ToolRunner};
use crate::tracker::{
    EngagementRef, EngagementRequest, ImportScanRequest, ImportScanResponse, TrackerClient,
};

#[derive(Debug, Clone)]
enum Reply {
    Outcome(ToolOutcome),
    Error(ToolError),
    Delay(Duration),
}

/// Tool runner that answers from scripted rules instead of spawning.
///
/// Rules match on the prefix of the invocation's display command; the most
/// recently added matching rule wins. Unmatched invocations exit 0 silently.
#[derive(Debug, Default)]
pub struct ScriptedToolRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedToolRunner {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `outcome`.
    pub fn respond(&self, prefix: impl Into<String>, outcome: ToolOutcome) {
        self.rules.lock().push((prefix.into(), Reply::Outcome(outcome)));
    }

    /// Fails commands starting with `prefix`.
    pub fn fail(&self, prefix: impl Into<String>, error: ToolError) {
        self.rules.lock().push((prefix.into(), Reply::Error(error)));
    }

    /// Makes commands starting with `prefix` take `delay` before exiting 0.
    pub fn delay(&self, prefix: impl Into<String>, delay: Duration) {
        self.rules.lock().push((prefix.into(), Reply::Delay(delay)));
    }

    /// Returns every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn reply_for(&self, command: &str) -> Option<Reply> {
        self.rules
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        let command = invocation.display_command();
        self.calls.lock().push(command.clone());

        match self.reply_for(&command) {
            None => Ok(ToolOutcome::exited(0, "", "")),
            Some(Reply::Outcome(outcome)) => Ok(outcome),
            Some(Reply::Error(error)) => Err(error),
            Some(Reply::Delay(delay)) => {
                if delay > invocation.timeout {
                    tokio::time::sleep(invocation.timeout).await;
                    return Err(ToolError::Timeout {
                        program: invocation.program.clone(),
                        timeout_ms: u64::try_from(invocation.timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
                tokio::time::sleep(delay).await;
                let mut outcome = ToolOutcome::exited(0, "", "");
                outcome.duration = delay;
                Ok(outcome)
            }
        }
    }
}

/// Container runtime held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryContainerRuntime {
    containers: Mutex<BTreeMap<String, ContainerState>>,
    networks: Mutex<BTreeSet<String>>,
    creates: AtomicUsize,
    mutations: AtomicUsize,
    fail_removals: AtomicBool,
    fail_creates: AtomicBool,
}

impl InMemoryContainerRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a container's state.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<ContainerState> {
        self.containers.lock().get(name).cloned()
    }

    /// Places a container directly, bypassing the mutation counters.
    pub fn insert(&self, state: ContainerState) {
        self.containers.lock().insert(state.name.clone(), state);
    }

    /// Simulates a container exiting.
    pub fn stop(&self, name: &str) {
        if let Some(state) = self.containers.lock().get_mut(name) {
            state.running = false;
        }
    }

    /// Changes a restart policy out of band.
    pub fn set_policy(&self, name: &str, policy: RestartPolicy) {
        if let Some(state) = self.containers.lock().get_mut(name) {
            state.restart_policy = policy;
        }
    }

    /// Number of containers created.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of state-changing calls served.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// True if the network exists.
    #[must_use]
    pub fn network_exists(&self, name: &str) -> bool {
        self.networks.lock().contains(name)
    }

    /// Makes every removal fail.
    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Makes every creation fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    fn with_container<T>(
        &self,
        operation: &str,
        name: &str,
        f: impl FnOnce(&mut ContainerState) -> T,
    ) -> Result<T, EnvironmentError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.containers
            .lock()
            .get_mut(name)
            .map(f)
            .ok_or_else(|| EnvironmentError::runtime(operation, name, "No such container"))
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryContainerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EnvironmentError> {
        Ok(self.container(name))
    }

    async fn create(
        &self,
        environment: &str,
        network: Option<&str>,
        service: &ServiceSpec,
    ) -> Result<(), EnvironmentError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(EnvironmentError::runtime(
                "create",
                &service.name,
                "image pull failed",
            ));
        }
        if let Some(network) = network {
            if !self.network_exists(network) {
                return Err(EnvironmentError::runtime(
                    "create",
                    &service.name,
                    format!("network {network} not found"),
                ));
            }
        }
        let mut containers = self.containers.lock();
        if containers.contains_key(&service.name) {
            return Err(EnvironmentError::runtime(
                "create",
                &service.name,
                "container name already in use",
            ));
        }
        containers.insert(
            service.name.clone(),
            ContainerState {
                name: service.name.clone(),
                image: service.image_ref(),
                running: false,
                healthy: None,
                restart_policy: service.restart_policy,
                retention: Some(service.retention),
                environment: Some(environment.to_string()),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), EnvironmentError> {
        self.with_container("start", name, |state| state.running = true)
    }

    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), EnvironmentError> {
        self.with_container("update", name, |state| state.restart_policy = policy)
    }

    async fn remove(&self, name: &str) -> Result<(), EnvironmentError> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(EnvironmentError::runtime("remove", name, "device or resource busy"));
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().remove(name);
        Ok(())
    }

    async fn list(&self, environment: &str) -> Result<Vec<ContainerState>, EnvironmentError> {
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| c.environment.as_deref() == Some(environment))
            .cloned()
            .collect())
    }

    async fn ensure_network(
        &self,
        _environment: &str,
        name: &str,
    ) -> Result<bool, EnvironmentError> {
        let created = self.networks.lock().insert(name.to_string());
        if created {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(created)
    }

    async fn prune_images(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }
}

/// Findings tracker held entirely in memory.
///
/// Creation does not enforce unique names, so duplicate engagements show up
/// in [`InMemoryTracker::engagements_named`].
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    engagements: Mutex<Vec<EngagementRef>>,
    imports: Mutex<Vec<ImportScanRequest>>,
    tokens: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
    creates: AtomicUsize,
    fail_creates: AtomicBool,
    fail_imports: AtomicBool,
}

impl InMemoryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of engagements created.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of engagements carrying `name`.
    #[must_use]
    pub fn engagements_named(&self, name: &str) -> usize {
        self.engagements
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    /// Returns every accepted upload.
    #[must_use]
    pub fn imports(&self) -> Vec<ImportScanRequest> {
        self.imports.lock().clone()
    }

    /// Distinct tokens calls were authenticated with.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().iter().cloned().collect()
    }

    fn authenticate(&self, token: &SecretString) {
        self.tokens.lock().insert(token.expose_secret().to_string());
    }

    /// Makes engagement creation fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Makes uploads fail.
    pub fn fail_imports(&self, fail: bool) {
        self.fail_imports.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrackerClient for InMemoryTracker {
    async fn find_engagement(
        &self,
        name: &str,
        token: &SecretString,
    ) -> Result<Option<EngagementRef>, TrackerError> {
        self.authenticate(token);
        Ok(self
            .engagements
            .lock()
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn create_engagement(
        &self,
        request: &EngagementRequest,
        token: &SecretString,
    ) -> Result<EngagementRef, TrackerError> {
        self.authenticate(token);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(TrackerError::Status {
                endpoint: "engagements/".to_string(),
                status: 500,
                body: "internal error".to_string(),
            });
        }
        tokio::task::yield_now().await;
        let engagement = EngagementRef {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: request.name.clone(),
        };
        self.engagements.lock().push(engagement.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(engagement)
    }

    async fn import_scan(
        &self,
        request: ImportScanRequest,
        token: &SecretString,
    ) -> Result<ImportScanResponse, TrackerError> {
        self.authenticate(token);
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(TrackerError::Status {
                endpoint: "import-scan/".to_string(),
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        let mut imports = self.imports.lock();
        imports.push(request);
        Ok(ImportScanResponse {
            test_id: Some(imports.len() as u64),
        })
    }
}

/// Analysis server answering from scripted task states and gate statuses.
///
/// Task responses are served in order; the last one repeats. With nothing
/// scripted the task stays pending.
#[derive(Debug, Default)]
pub struct ScriptedAnalysisServer {
    tasks: Mutex<VecDeque<AnalysisTask>>,
    statuses: Mutex<BTreeMap<String, Option<AnalysisVerdict>>>,
    task_queries: Mutex<Vec<String>>,
    status_queries: Mutex<Vec<String>>,
    tokens: Mutex<BTreeSet<String>>,
}

impl ScriptedAnalysisServer {
    /// Creates a server with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next task response.
    pub fn push_task(&self, task: AnalysisTask) {
        self.tasks.lock().push_back(task);
    }

    /// Sets the gate status reported for `analysis_id`.
    pub fn set_status(&self, analysis_id: &str, verdict: Option<AnalysisVerdict>) {
        self.statuses.lock().insert(analysis_id.to_string(), verdict);
    }

    /// Task ids queried, in order.
    #[must_use]
    pub fn task_queries(&self) -> Vec<String> {
        self.task_queries.lock().clone()
    }

    /// Analysis ids whose gate status was queried, in order.
    #[must_use]
    pub fn status_queries(&self) -> Vec<String> {
        self.status_queries.lock().clone()
    }

    /// Distinct tokens calls were authenticated with.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().iter().cloned().collect()
    }

    fn authenticate(&self, token: Option<&SecretString>) {
        if let Some(token) = token {
            self.tokens.lock().insert(token.expose_secret().to_string());
        }
    }
}

#[async_trait]
impl AnalysisServer for ScriptedAnalysisServer {
    async fn task(
        &self,
        task_id: &str,
        token: Option<&SecretString>,
    ) -> Result<AnalysisTask, GateError> {
        self.authenticate(token);
        self.task_queries.lock().push(task_id.to_string());
        let mut tasks = self.tasks.lock();
        let task = if tasks.len() > 1 {
            tasks.pop_front()
        } else {
            tasks.front().cloned()
        };
        Ok(task.unwrap_or_else(AnalysisTask::pending))
    }

    async fn project_status(
        &self,
        analysis_id: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<AnalysisVerdict>, GateError> {
        self.authenticate(token);
        self.status_queries.lock().push(analysis_id.to_string());
        Ok(self.statuses.lock().get(analysis_id).copied().flatten())
    }
}
