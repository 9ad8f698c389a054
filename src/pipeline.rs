//! Preparation pipeline - builds a server container from image to booted world
//!
//! A job walks Allocating -> Creating -> BootWaiting -> WorldBootstrapping ->
//! Pausing | Deploying -> Done. Any failure after the port is reserved tears
//! the attempt down and restarts from Allocating after the retry delay; there
//! is no attempt limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent::{AgentStatus, ManagementAgent, ProgressStream};
use crate::config::OrchestratorConfig;
use crate::credentials::CredentialVault;
use crate::db::ServerStore;
use crate::models::{ContainerRecord, ContainerStatus, StoredServer};
use crate::naming::NamingScheme;
use crate::ports::PortAllocator;
use crate::progress::{InFlight, InFlightTicket, ProgressSender};
use crate::runtime::{ContainerRuntime, CreateSpec};
use crate::volumes::WorldVolumeManager;
use crate::Result;

/// Persist the finished server under this name and owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub owner: Option<String>,
}

/// One request to prepare a container
pub struct PreparationJob {
    mc_version: String,
    server_id: Option<String>,
    ram_mb: Option<u32>,
    port: Option<u16>,
    auth_key: Option<String>,
    auto_deploy: bool,
    boot_signal: Option<oneshot::Sender<()>>,
    progress: Option<ProgressSender>,
    registration: Option<Registration>,
}

impl PreparationJob {
    /// Anonymous warm-pool container
    pub fn warm(mc_version: impl Into<String>) -> Self {
        Self {
            mc_version: mc_version.into(),
            server_id: None,
            ram_mb: None,
            port: None,
            auth_key: None,
            auto_deploy: false,
            boot_signal: None,
            progress: None,
            registration: None,
        }
    }

    /// Container for a known server identity
    pub fn for_server(server_id: impl Into<String>, mc_version: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Self::warm(mc_version)
        }
    }

    pub fn ram_mb(mut self, mb: u32) -> Self {
        self.ram_mb = Some(mb);
        self
    }

    /// Reuse a port the caller already holds. The port is never released by
    /// the job, even when an attempt fails.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    /// Leave the container running instead of pausing it into the pool
    pub fn auto_deploy(mut self, auto_deploy: bool) -> Self {
        self.auto_deploy = auto_deploy;
        self
    }

    /// Fired once, as soon as the container process is started
    pub fn on_boot(mut self, signal: oneshot::Sender<()>) -> Self {
        self.boot_signal = Some(signal);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn register_as(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn mc_version(&self) -> &str {
        &self.mc_version
    }

    fn publish(&self, message: impl Into<String>) {
        if let Some(progress) = &self.progress {
            progress.publish(message);
        }
    }
}

pub struct PreparationPipeline {
    config: Arc<OrchestratorConfig>,
    naming: NamingScheme,
    runtime: Arc<dyn ContainerRuntime>,
    agent: Arc<dyn ManagementAgent>,
    ports: Arc<PortAllocator>,
    vault: Arc<CredentialVault>,
    volumes: Arc<WorldVolumeManager>,
    in_flight: Arc<InFlight>,
    store: Option<Arc<dyn ServerStore>>,
    warm_index: AtomicU64,
}

impl PreparationPipeline {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn ManagementAgent>,
        ports: Arc<PortAllocator>,
        vault: Arc<CredentialVault>,
        volumes: Arc<WorldVolumeManager>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            naming: NamingScheme::new(&config),
            config,
            runtime,
            agent,
            ports,
            vault,
            volumes,
            in_flight,
            store: None,
            warm_index: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ServerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Make sure future warm names use indices at or above `next`
    pub fn seed_warm_index(&self, next: u64) {
        self.warm_index.fetch_max(next, Ordering::SeqCst);
    }

    /// Start a job on its own task. The job is counted as in flight before
    /// this returns.
    pub fn submit(self: &Arc<Self>, job: PreparationJob) -> JoinHandle<ContainerRecord> {
        let ticket = self.in_flight.begin(&job.mc_version);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(job, ticket).await })
    }

    /// Drive a job to completion; transient failures are retried forever
    pub async fn run(&self, mut job: PreparationJob, ticket: InFlightTicket) -> ContainerRecord {
        let ram_mb = job.ram_mb.unwrap_or(self.config.default_ram_mb);
        let image = self.naming.image_for(&job.mc_version);

        job.publish("Preparing server preparation");
        self.runtime.pull_image(&image).await;
        job.publish("Starting server preparation");

        let retry_delay = self.config.retry_delay_duration();
        let record = loop {
            match self.attempt(&mut job, &image, ram_mb).await {
                Ok(record) => break record,
                Err(e) => {
                    tracing::warn!(
                        version = %job.mc_version,
                        server_id = ?job.server_id,
                        error = %e,
                        "Preparation attempt failed, retrying"
                    );
                    job.publish(format!(
                        "Couldn't start preparation container. Retrying in {}s...",
                        retry_delay.as_secs_f32()
                    ));
                    tokio::time::sleep(retry_delay).await;
                }
            }
        };

        if let Some(registration) = job.registration.take() {
            self.persist(&job, registration, &record);
        }

        tracing::info!(
            container = %record.container_id,
            name = %record.name,
            port = record.port,
            status = %record.status,
            "Preparation finished"
        );

        drop(ticket);
        if let Some(progress) = job.progress.take() {
            progress.finish();
        }
        record
    }

    async fn attempt(&self, job: &mut PreparationJob, image: &str, ram_mb: u32) -> Result<ContainerRecord> {
        // Allocating
        let port_drawn = job.port.is_none();
        let port = match job.port {
            Some(port) => {
                self.ports.reserve(port);
                port
            }
            None => self.ports.allocate(),
        };
        let auth_key = job.auth_key.clone().unwrap_or_else(CredentialVault::generate);
        let name = match &job.server_id {
            Some(server_id) => self.naming.server_name(server_id),
            None => self
                .naming
                .warm_name(self.warm_index.fetch_add(1, Ordering::SeqCst)),
        };

        let mut container_id = None;
        let result = self
            .boot(job, image, &name, port, &auth_key, ram_mb, &mut container_id)
            .await;

        if result.is_err() {
            self.discard(container_id.as_deref(), port, port_drawn).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn boot(
        &self,
        job: &mut PreparationJob,
        image: &str,
        name: &str,
        port: u16,
        auth_key: &str,
        ram_mb: u32,
        container_id: &mut Option<String>,
    ) -> Result<ContainerRecord> {
        // Creating
        let world_path = self.volumes.create(port)?;
        let spec = CreateSpec {
            image: image.to_string(),
            name: name.to_string(),
            host_port: port,
            container_port: self.config.image.container_port,
            env: CreateSpec::server_env(auth_key, ram_mb),
            world_path,
            world_mount_target: self.config.image.world_mount_target.clone(),
            memory_bytes: CreateSpec::memory_for(ram_mb),
        };
        let id = self.runtime.create(&spec).await?;
        *container_id = Some(id.clone());
        self.runtime.start(&id).await?;
        self.vault.bind(&id, auth_key);
        tracing::info!(container = %id, name, port, version = %job.mc_version, "Container started");

        // BootWaiting
        if let Some(signal) = job.boot_signal.take() {
            let _ = signal.send(());
        }

        // WorldBootstrapping
        self.bootstrap_world(job, port, auth_key).await?;
        job.publish("Waiting for preparation end");

        let status = if job.auto_deploy {
            ContainerStatus::Running
        } else {
            self.runtime.pause(&id).await?;
            ContainerStatus::Prepared
        };

        Ok(ContainerRecord {
            container_id: id,
            name: name.to_string(),
            server_id: job.server_id.clone(),
            mc_version: job.mc_version.clone(),
            port,
            ram_mb,
            auth_key: Some(auth_key.to_string()),
            status,
        })
    }

    async fn bootstrap_world(&self, job: &PreparationJob, port: u16, auth_key: &str) -> Result<()> {
        let status = self.wait_for_agent(port, auth_key).await?;
        if status.is_running() {
            job.publish("Preparing world 100%");
            return Ok(());
        }

        let mut progress = match self.agent.world_progress(port, auth_key).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::debug!(port, error = %e, "World progress unavailable");
                None
            }
        };

        let start = self.agent.start_and_wait(port, auth_key);
        tokio::pin!(start);

        let mut last = None;
        loop {
            tokio::select! {
                result = &mut start => {
                    result?;
                    break;
                }
                percent = next_percent(&mut progress) => match percent {
                    Some(percent) if last.map_or(true, |l| percent > l) => {
                        last = Some(percent);
                        job.publish(format!("Preparing world {}%", percent));
                    }
                    Some(_) => {}
                    None => progress = None,
                },
            }
        }

        if last != Some(100) {
            job.publish("Preparing world 100%");
        }
        Ok(())
    }

    /// Poll the agent until it answers or the ready timeout passes
    async fn wait_for_agent(&self, port: u16, auth_key: &str) -> Result<AgentStatus> {
        let deadline = Instant::now() + self.config.agent.ready_timeout();
        loop {
            match self.agent.status(port, auth_key).await {
                Ok(status) => return Ok(status),
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!(port, error = %e, "Agent not reachable yet");
                    tokio::time::sleep(self.config.agent.poll_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Undo a failed attempt. Caller-held ports and their worlds are kept, as
    /// is everything a container that could not be removed still uses.
    async fn discard(&self, container_id: Option<&str>, port: u16, port_drawn: bool) {
        if let Some(id) = container_id {
            if let Err(e) = self.runtime.remove(id).await {
                tracing::error!(
                    container = %id,
                    port,
                    error = %e,
                    "Failed to remove container of failed attempt, keeping its port"
                );
                return;
            }
            self.vault.unbind(id);
        }
        if port_drawn {
            if let Err(e) = self.volumes.remove(port) {
                tracing::warn!(port, error = %e, "Failed to delete world of failed attempt");
            }
            self.ports.release(port);
        }
    }

    fn persist(&self, job: &PreparationJob, registration: Registration, record: &ContainerRecord) {
        let Some(store) = &self.store else {
            return;
        };
        let server = StoredServer::new(registration.name, record).with_owner(registration.owner);
        if let Err(e) = store.upsert_server(&server) {
            tracing::error!(server_id = %server.server_id, error = %e, "Failed to persist server");
            job.publish("Couldn't add server to database");
        }
    }
}

async fn next_percent(progress: &mut Option<ProgressStream>) -> Option<u8> {
    match progress {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::DONE_MESSAGE;
    use crate::testing::{FakeAgent, FakeRuntime, Harness};

    #[tokio::test]
    async fn test_warm_job_ends_paused_in_pool() {
        let h = Harness::new();
        let pipeline = h.orchestrator.pipeline();

        let record = pipeline.submit(PreparationJob::warm("1.19.3").ram_mb(1024)).await.unwrap();

        assert_eq!(record.status, ContainerStatus::Prepared);
        assert_eq!(record.server_id, None);
        assert_eq!(record.name, "MC-Server-ready0");
        assert_eq!(record.ram_mb, 1024);

        let container = h.runtime.container(&record.container_id).unwrap();
        assert!(container.paused);
        assert_eq!(container.image, "ghcr.io/instantminecraft/client:mc-1.19.3");
        assert!(container.env.contains(&"autostart=false".to_string()));
        assert!(container.env.contains(&"ram=1024".to_string()));
        assert_eq!(container.memory_bytes, 1_024_000_000);

        assert_eq!(h.orchestrator.vault().lookup(&record.container_id), record.auth_key);
        assert!(h.orchestrator.ports().is_reserved(record.port));
        assert_eq!(h.runtime.pulls(), vec!["ghcr.io/instantminecraft/client:mc-1.19.3"]);
        assert_eq!(h.orchestrator.in_flight().total(), 0);
    }

    #[tokio::test]
    async fn test_create_failures_leave_one_container_and_one_port() {
        let h = Harness::with(FakeRuntime::default().fail_next_creates(3), FakeAgent::default());
        let pipeline = h.orchestrator.pipeline();

        let record = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();

        assert_eq!(h.runtime.create_calls(), 4);
        assert_eq!(h.runtime.containers().len(), 1);
        assert_eq!(h.orchestrator.ports().reserved(), vec![record.port]);
        assert_eq!(h.runtime.containers()[0].port, record.port);
    }

    #[tokio::test]
    async fn test_start_failure_removes_created_container() {
        let h = Harness::with(FakeRuntime::default().fail_next_starts(1), FakeAgent::default());
        let pipeline = h.orchestrator.pipeline();

        let record = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();

        assert_eq!(h.runtime.create_calls(), 2);
        assert_eq!(h.runtime.containers().len(), 1);
        assert_eq!(h.runtime.containers()[0].id, record.container_id);
        assert_eq!(h.orchestrator.vault().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_failure_retries_whole_attempt() {
        let h = Harness::with(FakeRuntime::default(), FakeAgent::default().fail_next_starts(1));
        let pipeline = h.orchestrator.pipeline();

        let record = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();

        assert_eq!(h.agent.start_calls(), 2);
        assert_eq!(h.runtime.containers().len(), 1);
        assert_eq!(h.orchestrator.ports().reserved(), vec![record.port]);
        assert!(h.orchestrator.volumes().exists(record.port));
    }

    #[tokio::test]
    async fn test_unremovable_container_keeps_its_port() {
        let h = Harness::with(FakeRuntime::default(), FakeAgent::default().fail_next_starts(1));
        h.runtime.fail_removes(true);
        let pipeline = h.orchestrator.pipeline();

        let record = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();

        let containers = h.runtime.containers();
        assert_eq!(containers.len(), 2);
        let stuck = containers.iter().find(|c| c.id != record.container_id).unwrap();
        assert_ne!(stuck.port, record.port);
        assert!(h.orchestrator.ports().is_reserved(stuck.port));
        assert!(h.orchestrator.ports().is_reserved(record.port));
        assert!(h.orchestrator.volumes().exists(stuck.port));
        assert!(h.orchestrator.vault().lookup(&stuck.id).is_some());
    }

    #[tokio::test]
    async fn test_given_port_is_kept_across_failures() {
        let h = Harness::with(FakeRuntime::default().fail_next_creates(2), FakeAgent::default());
        let pipeline = h.orchestrator.pipeline();
        h.orchestrator.ports().reserve(30042);
        h.orchestrator.volumes().create(30042).unwrap();
        std::fs::write(h.orchestrator.volumes().path_for(30042).join("level.dat"), b"x").unwrap();

        let job = PreparationJob::for_server("abc123", "1.18.2")
            .port(30042)
            .auto_deploy(true);
        let record = pipeline.submit(job).await.unwrap();

        assert_eq!(record.port, 30042);
        assert_eq!(record.name, "MC-Server-abc123");
        assert_eq!(record.server_id.as_deref(), Some("abc123"));
        assert_eq!(record.status, ContainerStatus::Running);
        assert!(!h.runtime.containers()[0].paused);
        assert!(h.orchestrator.volumes().path_for(30042).join("level.dat").exists());
    }

    #[tokio::test]
    async fn test_progress_sequence() {
        let h = Harness::with(
            FakeRuntime::default(),
            FakeAgent::default().with_progress(vec![10, 40, 30, 100]),
        );
        let pipeline = h.orchestrator.pipeline();
        let (tx, mut rx) = h.orchestrator.progress_hub().register("srv");

        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = rx.next().await {
                seen.push(message);
            }
            seen
        });

        pipeline
            .submit(PreparationJob::warm("1.19.3").with_progress(tx))
            .await
            .unwrap();
        let seen = collector.await.unwrap();

        // Intermediate messages may be dropped, but order and the final
        // message are preserved.
        assert_eq!(seen.last().map(String::as_str), Some(DONE_MESSAGE));
        let order = [
            "Preparing server preparation",
            "Starting server preparation",
            "Waiting for preparation end",
            DONE_MESSAGE,
        ];
        let positions: Vec<_> = order
            .iter()
            .filter_map(|m| seen.iter().position(|s| s == m))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let percents: Vec<u32> = seen
            .iter()
            .filter_map(|m| m.strip_prefix("Preparing world ")?.strip_suffix('%')?.parse().ok())
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_boot_signal_fires() {
        let h = Harness::new();
        let pipeline = h.orchestrator.pipeline();
        let (tx, rx) = oneshot::channel();

        let handle = pipeline.submit(PreparationJob::warm("1.19.3").on_boot(tx));
        rx.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_persists_server() {
        let h = Harness::new();
        let pipeline = h.orchestrator.pipeline();

        let job = PreparationJob::for_server("srv1", "1.19.3")
            .auto_deploy(true)
            .register_as(Registration {
                name: "survival".to_string(),
                owner: Some("alice".to_string()),
            });
        let record = pipeline.submit(job).await.unwrap();

        let stored = h.store.get_server("srv1").unwrap().unwrap();
        assert_eq!(stored.name, "survival");
        assert_eq!(stored.owner.as_deref(), Some("alice"));
        assert_eq!(stored.container_id, record.container_id);
        assert_eq!(stored.port, record.port);
    }

    #[tokio::test]
    async fn test_warm_names_are_monotonic() {
        let h = Harness::new();
        let pipeline = h.orchestrator.pipeline();
        pipeline.seed_warm_index(5);

        let first = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();
        let second = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();
        assert_eq!(first.name, "MC-Server-ready5");
        assert_eq!(second.name, "MC-Server-ready6");

        // Seeding lower never moves the index back
        pipeline.seed_warm_index(1);
        let third = pipeline.submit(PreparationJob::warm("1.19.3")).await.unwrap();
        assert_eq!(third.name, "MC-Server-ready7");
    }
}
