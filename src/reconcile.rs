//! Startup reconciliation of runtime state with stored servers

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::credentials::CredentialVault;
use crate::db::ServerStore;
use crate::models::ContainerRecord;
use crate::naming::{ContainerKind, NamingScheme};
use crate::pipeline::{PreparationJob, PreparationPipeline, Registration};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerDetails, ContainerRuntime, RuntimeContainer};
use crate::volumes::WorldVolumeManager;
use crate::Result;

/// What a reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Unfinished warm containers that were removed
    pub removed_orphans: usize,
    /// Prepared warm containers kept in the pool
    pub warm_containers: usize,
    pub warming_job_started: bool,
    /// Stored servers whose live container was found
    pub reattached: usize,
    /// Stored servers without a live container, being re-created
    pub restored: usize,
    /// Warming and restore jobs started by the pass
    pub jobs: Vec<JoinHandle<ContainerRecord>>,
}

struct Observed {
    container: RuntimeContainer,
    details: Option<ContainerDetails>,
}

impl Observed {
    fn port(&self) -> Option<u16> {
        self.container
            .public_port
            .or_else(|| self.details.as_ref()?.published_port)
    }

    fn auth_key(&self) -> Option<&str> {
        self.details.as_ref()?.auth_key()
    }
}

#[derive(Default)]
struct Survey {
    warm: Vec<(u64, Observed)>,
    assigned: Vec<(String, Observed)>,
}

pub struct Reconciler {
    config: Arc<OrchestratorConfig>,
    naming: NamingScheme,
    runtime: Arc<dyn ContainerRuntime>,
    pipeline: Arc<PreparationPipeline>,
    store: Arc<dyn ServerStore>,
    ports: Arc<PortAllocator>,
    vault: Arc<CredentialVault>,
    volumes: Arc<WorldVolumeManager>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        pipeline: Arc<PreparationPipeline>,
        store: Arc<dyn ServerStore>,
        ports: Arc<PortAllocator>,
        vault: Arc<CredentialVault>,
        volumes: Arc<WorldVolumeManager>,
    ) -> Self {
        Self {
            naming: NamingScheme::new(&config),
            config,
            runtime,
            pipeline,
            store,
            ports,
            vault,
            volumes,
        }
    }

    async fn survey(&self) -> Result<Survey> {
        let mut survey = Survey::default();
        for container in self.runtime.list().await? {
            let kind = self.naming.classify(&container.name);
            if kind == ContainerKind::Foreign {
                continue;
            }
            let details = match self.runtime.inspect(&container.id).await {
                Ok(details) => Some(details),
                Err(e) => {
                    tracing::warn!(container = %container.id, error = %e, "Failed to inspect container");
                    None
                }
            };
            let observed = Observed { container, details };
            match kind {
                ContainerKind::Warm(index) => survey.warm.push((index, observed)),
                ContainerKind::Assigned(server_id) => survey.assigned.push((server_id, observed)),
                ContainerKind::Foreign => {}
            }
        }
        Ok(survey)
    }

    fn adopt_container(&self, observed: &Observed) {
        if let Some(port) = observed.port() {
            self.ports.reserve(port);
        }
        if let Some(key) = observed.auth_key() {
            self.vault.bind(&observed.container.id, key);
        }
    }

    /// Take ownership of the ports and credentials of every live managed
    /// container without changing anything. Returns the number adopted.
    pub async fn adopt(&self) -> Result<usize> {
        let survey = self.survey().await?;
        let mut adopted = 0;
        for (index, observed) in &survey.warm {
            self.adopt_container(observed);
            self.pipeline.seed_warm_index(index + 1);
            adopted += 1;
        }
        for (_, observed) in &survey.assigned {
            self.adopt_container(observed);
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Repair the pool and restore stored servers. Jobs started here keep
    /// running after this returns; their handles are in the report.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let survey = self.survey().await?;
        let mut report = ReconcileReport::default();

        for (index, observed) in survey.warm {
            let paused = observed.details.as_ref().is_some_and(|d| d.paused);
            if paused {
                self.adopt_container(&observed);
                self.pipeline.seed_warm_index(index + 1);
                report.warm_containers += 1;
                continue;
            }

            // Never reached the paused state: the preparation was interrupted
            let id = &observed.container.id;
            tracing::info!(container = %id, name = %observed.container.name, "Removing unfinished warm container");
            if let Err(e) = self.runtime.remove(id).await {
                tracing::warn!(container = %id, error = %e, "Failed to remove unfinished warm container");
                self.adopt_container(&observed);
                continue;
            }
            if let Some(port) = observed.port() {
                if let Err(e) = self.volumes.remove(port) {
                    tracing::warn!(port, error = %e, "Failed to delete world of unfinished container");
                }
                self.ports.release(port);
            }
            report.removed_orphans += 1;
        }

        let mut live: HashMap<String, Observed> = HashMap::new();
        for (server_id, observed) in survey.assigned {
            self.adopt_container(&observed);
            live.insert(server_id, observed);
        }

        // Stored ports are claimed before any job can draw a port
        let servers = self.store.list_servers()?;
        for server in &servers {
            self.ports.reserve(server.port);
        }

        if report.warm_containers == 0 {
            let version = self.config.default_version().to_string();
            tracing::info!(version = %version, "Warm pool is empty, preparing a container");
            report.jobs.push(self.pipeline.submit(PreparationJob::warm(version)));
            report.warming_job_started = true;
        }

        for server in servers {
            if let Some(observed) = live.get(&server.server_id) {
                if observed.container.id != server.container_id {
                    tracing::info!(
                        server_id = %server.server_id,
                        container = %observed.container.id,
                        "Recording new container for server"
                    );
                    if let Err(e) = self
                        .store
                        .update_container_id(&server.server_id, &observed.container.id)
                    {
                        tracing::error!(server_id = %server.server_id, error = %e, "Failed to record container for server");
                    }
                }
                report.reattached += 1;
                continue;
            }

            tracing::info!(
                server_id = %server.server_id,
                port = server.port,
                version = %server.mc_version,
                "Restoring server without a live container"
            );
            let (booted, on_boot) = oneshot::channel();
            let job = PreparationJob::for_server(&server.server_id, &server.mc_version)
                .ram_mb(server.ram_mb)
                .port(server.port)
                .auto_deploy(true)
                .on_boot(booted)
                .register_as(Registration {
                    name: server.name.clone(),
                    owner: server.owner.clone(),
                });
            report.jobs.push(self.pipeline.submit(job));
            report.restored += 1;

            let server_id = server.server_id;
            tokio::spawn(async move {
                if on_boot.await.is_ok() {
                    tracing::info!(server_id = %server_id, "Restored server container started");
                }
            });
        }

        tracing::info!(
            removed = report.removed_orphans,
            warm = report.warm_containers,
            reattached = report.reattached,
            restored = report.restored,
            "Reconciliation finished"
        );
        Ok(report)
    }
}
