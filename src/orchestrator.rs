//! Orchestrator facade wiring the pool, pipeline and lifecycle together

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{HttpAgent, ManagementAgent};
use crate::config::OrchestratorConfig;
use crate::credentials::CredentialVault;
use crate::db::{ServerStore, SqliteStore};
use crate::lifecycle::{LifecyclePromoter, TeardownReport};
use crate::models::{ContainerRecord, ContainerStatus, SearchFilter, ServerInfo, StoredServer};
use crate::naming::NamingScheme;
use crate::pipeline::{PreparationJob, PreparationPipeline, Registration};
use crate::pool::PoolManager;
use crate::ports::PortAllocator;
use crate::progress::{InFlight, ProgressHub, ProgressReceiver};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::runtime::{ContainerRuntime, DockerRuntime, StatsStream};
use crate::volumes::WorldVolumeManager;
use crate::{Error, Result};

/// Broadcast to players when a pooled server is handed out
pub const WAKE_UP_MESSAGE: &str = "Server wake up successful";

/// A request for a new server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub name: String,
    pub mc_version: String,
    /// Falls back to the configured default
    pub ram_mb: Option<u32>,
    pub owner: Option<String>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>, mc_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mc_version: mc_version.into(),
            ram_mb: None,
            owner: None,
        }
    }

    pub fn ram_mb(mut self, mb: u32) -> Self {
        self.ram_mb = Some(mb);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Result of a provisioning request
pub enum Provisioned {
    /// Served from the warm pool; already running
    Ready(ServerInfo),
    /// Being prepared; follow `progress` until "Done"
    Preparing {
        server_id: String,
        name: String,
        mc_version: String,
        ram_mb: u32,
        progress: ProgressReceiver,
        handle: JoinHandle<ContainerRecord>,
    },
}

impl Provisioned {
    pub fn server_id(&self) -> &str {
        match self {
            Provisioned::Ready(info) => &info.server_id,
            Provisioned::Preparing { server_id, .. } => server_id,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Provisioned::Ready(_))
    }
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    agent: Arc<dyn ManagementAgent>,
    store: Arc<dyn ServerStore>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    vault: Arc<CredentialVault>,
    volumes: Arc<WorldVolumeManager>,
    progress: Arc<ProgressHub>,
    in_flight: Arc<InFlight>,
    pool: Arc<PoolManager>,
    pipeline: Arc<PreparationPipeline>,
    promoter: LifecyclePromoter,
    reconciler: Reconciler,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn ManagementAgent>,
        store: Arc<dyn ServerStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let naming = NamingScheme::new(&config);

        let ports = Arc::new(PortAllocator::new(config.ports));
        let vault = Arc::new(CredentialVault::default());
        let volumes = Arc::new(WorldVolumeManager::new(config.worlds_path())?);
        let in_flight = InFlight::new();

        let pool = Arc::new(PoolManager::new(
            runtime.clone(),
            naming.clone(),
            vault.clone(),
            config.default_ram_mb,
        ));
        let pipeline = Arc::new(
            PreparationPipeline::new(
                config.clone(),
                runtime.clone(),
                agent.clone(),
                ports.clone(),
                vault.clone(),
                volumes.clone(),
                in_flight.clone(),
            )
            .with_store(store.clone()),
        );
        let promoter = LifecyclePromoter::new(
            runtime.clone(),
            naming,
            pool.clone(),
            ports.clone(),
            vault.clone(),
            volumes.clone(),
        );
        let reconciler = Reconciler::new(
            config.clone(),
            runtime.clone(),
            pipeline.clone(),
            store.clone(),
            ports.clone(),
            vault.clone(),
            volumes.clone(),
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            ports = ?(config.ports.min, config.ports.max),
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            agent,
            store,
            runtime,
            ports,
            vault,
            volumes,
            progress: ProgressHub::new(),
            in_flight,
            pool,
            pipeline,
            promoter,
            reconciler,
        })
    }

    /// Wire the production collaborators: local Docker, HTTP agent, SQLite
    pub fn connect(config: OrchestratorConfig) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::connect(config.retry_delay_duration())?);
        let agent = Arc::new(HttpAgent::new(&config.agent)?);
        let store = Arc::new(SqliteStore::open(config.database_path())?);
        Self::new(config, runtime, agent, store)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn pipeline(&self) -> &Arc<PreparationPipeline> {
        &self.pipeline
    }

    pub fn promoter(&self) -> &LifecyclePromoter {
        &self.promoter
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn volumes(&self) -> &Arc<WorldVolumeManager> {
        &self.volumes
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub fn progress_hub(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    /// Startup reconciliation; see [`Reconciler::run`]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run().await
    }

    /// Adopt live containers without repairing anything
    pub async fn adopt(&self) -> Result<usize> {
        self.reconciler.adopt().await
    }

    fn validate(&self, request: &ProvisionRequest) -> Result<u32> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidRequest("server name cannot be empty".into()));
        }
        if !self.config.is_supported_version(&request.mc_version) {
            return Err(Error::InvalidRequest(format!(
                "unsupported version {}",
                request.mc_version
            )));
        }
        let ram_mb = request.ram_mb.unwrap_or(self.config.default_ram_mb);
        if ram_mb == 0 || ram_mb > self.config.max_ram_mb {
            return Err(Error::InvalidRequest(format!(
                "ram must be between 1 and {}MB, got {}MB",
                self.config.max_ram_mb, ram_mb
            )));
        }
        Ok(ram_mb)
    }

    /// Hand out a warm container if one matches, otherwise prepare a new
    /// server in the background.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Provisioned> {
        let ram_mb = self.validate(&request)?;

        let filter = SearchFilter::prepared()
            .version(&request.mc_version)
            .ram_mb(ram_mb);
        for candidate in self.pool.find(&filter).await? {
            match self.promoter.promote(&candidate.container_id, &request.name).await {
                Ok(record) => {
                    let info = self.finish_promotion(&request, &record)?;
                    return Ok(Provisioned::Ready(info));
                }
                // Taken by a concurrent request
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        let server_id = Uuid::new_v4().simple().to_string();
        tracing::info!(
            server_id = %server_id,
            version = %request.mc_version,
            ram_mb,
            "No prepared container available, preparing a new one"
        );

        let (sender, progress) = self.progress.register(&server_id);
        let job = PreparationJob::for_server(&server_id, &request.mc_version)
            .ram_mb(ram_mb)
            .auto_deploy(true)
            .with_progress(sender)
            .register_as(Registration {
                name: request.name.clone(),
                owner: request.owner.clone(),
            });
        let handle = self.pipeline.submit(job);

        Ok(Provisioned::Preparing {
            server_id,
            name: request.name,
            mc_version: request.mc_version,
            ram_mb,
            progress,
            handle,
        })
    }

    fn finish_promotion(&self, request: &ProvisionRequest, record: &ContainerRecord) -> Result<ServerInfo> {
        if let Some(auth_key) = record.auth_key.clone() {
            let agent = self.agent.clone();
            let port = record.port;
            tokio::spawn(async move {
                if let Err(e) = agent.send_message(port, &auth_key, WAKE_UP_MESSAGE).await {
                    tracing::warn!(port, error = %e, "Failed to notify players");
                }
            });
        }

        let server = StoredServer::new(&request.name, record).with_owner(request.owner.clone());
        if let Err(e) = self.store.upsert_server(&server) {
            tracing::error!(server_id = %server.server_id, error = %e, "Couldn't add server to database");
            return Err(e);
        }

        self.replenish_in_background(&record.mc_version, record.ram_mb);
        tracing::info!(
            server_id = %server.server_id,
            port = record.port,
            "Server provisioned from pool"
        );
        Ok(ServerInfo::from_record(&request.name, record))
    }

    fn replenish_in_background(&self, mc_version: &str, ram_mb: u32) {
        let pool = self.pool.clone();
        let pipeline = self.pipeline.clone();
        let min_warm = self.config.min_warm;
        let mc_version = mc_version.to_string();
        // Counted before spawning so callers can wait for the refill
        let ticket = self.in_flight.begin(&mc_version);
        tokio::spawn(async move {
            let _ticket = ticket;
            match count_warm(&pool, &mc_version, ram_mb).await {
                Ok(have) if have < min_warm => {
                    tracing::info!(version = %mc_version, ram_mb, missing = min_warm - have, "Replenishing warm pool");
                    for _ in have..min_warm {
                        pipeline.submit(PreparationJob::warm(&mc_version).ram_mb(ram_mb));
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(version = %mc_version, error = %e, "Failed to check pool size"),
            }
        });
    }

    /// Submit warm jobs until the pool holds `min_warm` containers of this
    /// version and RAM, counting ones still preparing.
    pub async fn replenish(&self, mc_version: &str, ram_mb: u32) -> Result<Vec<JoinHandle<ContainerRecord>>> {
        let have = count_warm(&self.pool, mc_version, ram_mb).await?;
        Ok((have..self.config.min_warm)
            .map(|_| self.pipeline.submit(PreparationJob::warm(mc_version).ram_mb(ram_mb)))
            .collect())
    }

    /// Explicitly prepare `count` warm containers
    pub fn warm(&self, mc_version: &str, ram_mb: Option<u32>, count: usize) -> Result<Vec<JoinHandle<ContainerRecord>>> {
        let request = ProvisionRequest {
            ram_mb,
            ..ProvisionRequest::new("warm", mc_version)
        };
        let ram_mb = self.validate(&request)?;
        Ok((0..count)
            .map(|_| self.pipeline.submit(PreparationJob::warm(mc_version).ram_mb(ram_mb)))
            .collect())
    }

    pub async fn prepared(&self) -> Result<Vec<ContainerRecord>> {
        self.pool.find(&SearchFilter::prepared()).await
    }

    /// Live servers that have a stored record
    pub async fn running_servers(&self) -> Result<Vec<ServerInfo>> {
        let stored: HashMap<String, StoredServer> = self
            .store
            .list_servers()?
            .into_iter()
            .map(|s| (s.server_id.clone(), s))
            .collect();

        Ok(self
            .pool
            .find(&SearchFilter::running())
            .await?
            .iter()
            .filter_map(|record| {
                let server = stored.get(record.server_id.as_deref()?)?;
                Some(ServerInfo::from_record(&server.name, record))
            })
            .collect())
    }

    /// Remove a server for good. The stored record is deleted only when
    /// every teardown step succeeded.
    pub async fn delete_server(&self, server_id: &str) -> Result<TeardownReport> {
        let server = self
            .store
            .get_server(server_id)?
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        let report = match self.promoter.decommission(server_id).await {
            Ok(report) => report,
            Err(e) if e.is_not_found() => {
                tracing::info!(server_id, "No live container, deleting world only");
                let world = self.volumes.remove(server.port);
                if world.is_ok() {
                    self.ports.release(server.port);
                }
                TeardownReport {
                    server_id: server_id.to_string(),
                    container_id: server.container_id.clone(),
                    port: server.port,
                    container: Ok(()),
                    world,
                }
            }
            Err(e) => return Err(e),
        };

        if report.is_complete() {
            self.store.delete_server(server_id)?;
            tracing::info!(server_id, "Server deleted");
        }
        Ok(report)
    }

    /// Follow the preparation of a server, if it is in progress
    pub fn progress(&self, server_id: &str) -> Option<ProgressReceiver> {
        self.progress.subscribe(server_id)
    }

    /// Resource usage samples of a running server
    pub async fn stats(&self, server_id: &str) -> Result<StatsStream> {
        let record = self
            .pool
            .find_running(server_id)
            .await?
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;
        self.runtime.stream_stats(&record.container_id).await
    }

    /// Status of a stored server
    pub async fn server_status(&self, server_id: &str) -> Result<ContainerStatus> {
        if self.store.get_server(server_id)?.is_none() {
            return Err(Error::ServerNotFound(server_id.to_string()));
        }
        Ok(match self.pool.find_running(server_id).await? {
            Some(_) => ContainerStatus::Running,
            None if self.progress.is_active(server_id) => ContainerStatus::Preparing,
            None => ContainerStatus::Stopped,
        })
    }

    /// Best-effort wait until no job for the version is in flight
    pub async fn wait_version_idle(&self, mc_version: &str) {
        self.in_flight.wait_version_idle(mc_version).await
    }

    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await
    }
}

/// Prepared plus still-preparing warm containers of a version and RAM
async fn count_warm(pool: &PoolManager, mc_version: &str, ram_mb: u32) -> Result<usize> {
    let filter = SearchFilter::prepared().version(mc_version).ram_mb(ram_mb);
    let prepared = pool.find(&filter).await?.len();
    let preparing = pool
        .find(&filter.with_status(ContainerStatus::Preparing))
        .await?
        .len();
    Ok(prepared + preparing)
}
