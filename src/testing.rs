//! In-memory collaborators for unit tests

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::agent::{no_progress, AgentStatus, ManagementAgent, ProgressStream};
use crate::config::OrchestratorConfig;
use crate::db::{ServerStore, SqliteStore};
use crate::naming::NamingScheme;
use crate::orchestrator::Orchestrator;
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerStats, CreateSpec, RuntimeContainer, StatsStream,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub port: u16,
    pub env: Vec<String>,
    pub memory_bytes: i64,
    pub paused: bool,
    pub running: bool,
}

#[derive(Default)]
struct RuntimeState {
    containers: Vec<FakeContainer>,
    next_id: u64,
    create_failures: usize,
    start_failures: usize,
    fail_removes: bool,
    create_calls: usize,
    pulls: Vec<String>,
    stats: Vec<ContainerStats>,
}

impl RuntimeState {
    fn find_mut(&mut self, id: &str) -> Result<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Runtime(format!("No such container: {}", id)))
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:012x}", self.next_id)
    }
}

/// Container runtime kept in memory. Listing only reports started containers.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn fail_next_creates(self, n: usize) -> Self {
        self.state.lock().create_failures = n;
        self
    }

    pub fn fail_next_starts(self, n: usize) -> Self {
        self.state.lock().start_failures = n;
        self
    }

    pub fn fail_removes(&self, fail: bool) {
        self.state.lock().fail_removes = fail;
    }

    pub fn with_stats(self, stats: Vec<ContainerStats>) -> Self {
        self.state.lock().stats = stats;
        self
    }

    /// Insert an already running container
    pub fn add_container(
        &self,
        name: impl Into<String>,
        image: impl Into<String>,
        port: u16,
        env: Vec<String>,
        paused: bool,
    ) -> String {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.into(),
            image: image.into(),
            port,
            env,
            memory_bytes: 0,
            paused,
            running: true,
        });
        id
    }

    pub fn set_paused(&self, id: &str, paused: bool) {
        if let Ok(container) = self.state.lock().find_mut(id) {
            container.paused = paused;
        }
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.iter().find(|c| c.id == id).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.iter().find(|c| c.name == name).cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self) -> Result<Vec<RuntimeContainer>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|c| c.running)
            .map(|c| RuntimeContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                public_port: Some(c.port),
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(Error::Runtime("simulated create failure".into()));
        }
        if state.containers.iter().any(|c| c.name == spec.name) {
            return Err(Error::Runtime(format!("Conflict. The container name {} is already in use", spec.name)));
        }
        let id = state.next_id();
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            port: spec.host_port,
            env: spec.env.clone(),
            memory_bytes: spec.memory_bytes,
            paused: false,
            running: false,
        });
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.start_failures > 0 {
            state.start_failures -= 1;
            return Err(Error::Runtime("simulated start failure".into()));
        }
        state.find_mut(container_id)?.running = true;
        Ok(())
    }

    async fn pause(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let container = state.find_mut(container_id)?;
        if container.paused {
            return Err(Error::Runtime(format!("Container {} is already paused", container_id)));
        }
        container.paused = true;
        Ok(())
    }

    async fn unpause(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let container = state.find_mut(container_id)?;
        if !container.paused {
            return Err(Error::Runtime(format!("Container {} is not paused", container_id)));
        }
        container.paused = false;
        Ok(())
    }

    async fn rename(&self, container_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.containers.iter().any(|c| c.name == name) {
            return Err(Error::Runtime(format!("Conflict. The container name {} is already in use", name)));
        }
        state.find_mut(container_id)?.name = name.to_string();
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_removes {
            return Err(Error::Runtime("simulated remove failure".into()));
        }
        let before = state.containers.len();
        state.containers.retain(|c| c.id != container_id);
        if state.containers.len() == before {
            return Err(Error::Runtime(format!("No such container: {}", container_id)));
        }
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails> {
        let mut state = self.state.lock();
        let container = state.find_mut(container_id)?;
        Ok(ContainerDetails {
            env: container.env.clone(),
            published_port: Some(container.port),
            paused: container.paused,
        })
    }

    async fn stream_stats(&self, container_id: &str) -> Result<StatsStream> {
        let mut state = self.state.lock();
        state.find_mut(container_id)?;
        Ok(stream::iter(state.stats.clone()).boxed())
    }

    async fn pull_image(&self, image: &str) {
        self.state.lock().pulls.push(image.to_string());
    }
}

struct AgentState {
    already_running: bool,
    progress: Vec<u8>,
    start_failures: usize,
    status_failures: usize,
    start_calls: usize,
    started: HashSet<u16>,
    messages: Vec<(u16, String)>,
}

/// Management agent that boots worlds instantly
pub struct FakeAgent {
    state: Mutex<AgentState>,
    start_delay: Duration,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            state: Mutex::new(AgentState {
                already_running: false,
                progress: Vec::new(),
                start_failures: 0,
                status_failures: 0,
                start_calls: 0,
                started: HashSet::new(),
                messages: Vec::new(),
            }),
            start_delay: Duration::from_millis(20),
        }
    }
}

impl FakeAgent {
    pub fn with_progress(self, progress: Vec<u8>) -> Self {
        self.state.lock().progress = progress;
        self
    }

    pub fn already_running(self) -> Self {
        self.state.lock().already_running = true;
        self
    }

    pub fn fail_next_starts(self, n: usize) -> Self {
        self.state.lock().start_failures = n;
        self
    }

    pub fn fail_next_status(self, n: usize) -> Self {
        self.state.lock().status_failures = n;
        self
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn messages(&self) -> Vec<(u16, String)> {
        self.state.lock().messages.clone()
    }
}

#[async_trait]
impl ManagementAgent for FakeAgent {
    async fn status(&self, port: u16, _auth_key: &str) -> Result<AgentStatus> {
        let mut state = self.state.lock();
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(Error::Agent("connection refused".into()));
        }
        Ok(AgentStatus::running(state.already_running || state.started.contains(&port)))
    }

    async fn start_and_wait(&self, port: u16, _auth_key: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.start_calls += 1;
            if state.start_failures > 0 {
                state.start_failures -= 1;
                return Err(Error::Agent("world failed to start".into()));
            }
        }
        tokio::time::sleep(self.start_delay).await;
        self.state.lock().started.insert(port);
        Ok(())
    }

    async fn world_progress(&self, _port: u16, _auth_key: &str) -> Result<ProgressStream> {
        let progress = self.state.lock().progress.clone();
        if progress.is_empty() {
            return Ok(no_progress());
        }
        Ok(stream::iter(progress).boxed())
    }

    async fn send_message(&self, port: u16, _auth_key: &str, message: &str) -> Result<()> {
        self.state.lock().messages.push((port, message.to_string()));
        Ok(())
    }
}

pub fn test_config(data_dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new()
        .data_dir(data_dir)
        .port_range(30000, 30100)
        .retry_delay(Duration::from_millis(5))
        .min_warm(1);
    config.agent.poll_interval_ms = 5;
    config.agent.ready_timeout_ms = 1000;
    config
}

/// An orchestrator wired to fakes and an in-memory store
pub struct Harness {
    pub temp: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub agent: Arc<FakeAgent>,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeRuntime::default(), FakeAgent::default())
    }

    pub fn with(runtime: FakeRuntime, agent: FakeAgent) -> Self {
        Self::with_config(runtime, agent, |_| {})
    }

    pub fn with_config(
        runtime: FakeRuntime,
        agent: FakeAgent,
        configure: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Self::with_store(runtime, agent, store, configure)
    }

    /// Like `with_config`, with a store that may already hold servers
    pub fn with_store(
        runtime: FakeRuntime,
        agent: FakeAgent,
        store: Arc<SqliteStore>,
        configure: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        configure(&mut config);

        let runtime = Arc::new(runtime);
        let agent = Arc::new(agent);
        let orchestrator = Orchestrator::new(
            config,
            runtime.clone(),
            agent.clone(),
            store.clone() as Arc<dyn ServerStore>,
        )
        .unwrap();

        Self {
            temp,
            runtime,
            agent,
            store,
            orchestrator,
        }
    }

    fn naming(&self) -> NamingScheme {
        NamingScheme::new(self.orchestrator.config())
    }

    /// Insert a warm-pool container as if left behind by an earlier run
    pub fn add_warm(&self, index: u64, version: &str, ram_mb: u32, port: u16, paused: bool) -> String {
        let naming = self.naming();
        self.runtime.add_container(
            naming.warm_name(index),
            naming.image_for(version),
            port,
            CreateSpec::server_env(&format!("key-{}", port), ram_mb),
            paused,
        )
    }

    /// Insert a running assigned-server container
    pub fn add_assigned(&self, server_id: &str, version: &str, ram_mb: u32, port: u16) -> String {
        let naming = self.naming();
        self.runtime.add_container(
            naming.server_name(server_id),
            naming.image_for(version),
            port,
            CreateSpec::server_env(&format!("key-{}", port), ram_mb),
            false,
        )
    }
}
