//! Promotion of warm containers and teardown of assigned servers
//!
//! Neither operation retries; failures go straight back to the caller.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::credentials::CredentialVault;
use crate::models::{ContainerRecord, ContainerStatus};
use crate::naming::NamingScheme;
use crate::pool::PoolManager;
use crate::ports::PortAllocator;
use crate::runtime::ContainerRuntime;
use crate::volumes::WorldVolumeManager;
use crate::{Error, Result};

/// Outcome of each teardown step, reported independently
#[derive(Debug)]
pub struct TeardownReport {
    pub server_id: String,
    pub container_id: String,
    pub port: u16,
    pub container: Result<()>,
    pub world: Result<()>,
}

impl TeardownReport {
    /// Both steps succeeded and the port was released
    pub fn is_complete(&self) -> bool {
        self.container.is_ok() && self.world.is_ok()
    }

    /// Collapse into the first failed step
    pub fn into_result(self) -> Result<()> {
        self.container?;
        self.world
    }
}

pub struct LifecyclePromoter {
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingScheme,
    pool: Arc<PoolManager>,
    ports: Arc<PortAllocator>,
    vault: Arc<CredentialVault>,
    volumes: Arc<WorldVolumeManager>,
    claims: Mutex<HashSet<String>>,
}

impl LifecyclePromoter {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        naming: NamingScheme,
        pool: Arc<PoolManager>,
        ports: Arc<PortAllocator>,
        vault: Arc<CredentialVault>,
        volumes: Arc<WorldVolumeManager>,
    ) -> Self {
        Self {
            runtime,
            naming,
            pool,
            ports,
            vault,
            volumes,
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Turn a Prepared container into a Running server with a fresh server ID.
    ///
    /// A container that is not Prepared, or that another promotion is
    /// already working on, is reported as not found.
    pub async fn promote(&self, container_id: &str, name: &str) -> Result<ContainerRecord> {
        if !self.claims.lock().insert(container_id.to_string()) {
            return Err(Error::PreparedContainerNotFound(container_id.to_string()));
        }
        let result = self.promote_claimed(container_id, name).await;
        self.claims.lock().remove(container_id);
        result
    }

    async fn promote_claimed(&self, container_id: &str, name: &str) -> Result<ContainerRecord> {
        let record = self
            .pool
            .find_prepared(container_id)
            .await?
            .ok_or_else(|| Error::PreparedContainerNotFound(container_id.to_string()))?;

        let server_id = Uuid::new_v4().simple().to_string();
        let server_name = self.naming.server_name(&server_id);

        self.runtime.rename(container_id, &server_name).await?;
        if let Err(e) = self.runtime.unpause(container_id).await {
            // Put it back so it stays visible as a Prepared container
            if let Err(rename_err) = self.runtime.rename(container_id, &record.name).await {
                tracing::warn!(container = %container_id, error = %rename_err, "Failed to restore warm name");
            }
            return Err(e);
        }

        tracing::info!(
            container = %container_id,
            server_id = %server_id,
            name,
            port = record.port,
            version = %record.mc_version,
            "Promoted warm container"
        );

        Ok(ContainerRecord {
            name: server_name,
            server_id: Some(server_id),
            auth_key: record.auth_key.or_else(|| self.vault.lookup(container_id)),
            status: ContainerStatus::Running,
            ..record
        })
    }

    /// Tear down a running server: remove its container and world, then
    /// release its port. The port and credential are only released when
    /// both steps succeed.
    pub async fn decommission(&self, server_id: &str) -> Result<TeardownReport> {
        let record = self
            .pool
            .find_assigned(server_id)
            .await?
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        tracing::info!(server_id, container = %record.container_id, port = record.port, "Decommissioning server");

        let container = self.runtime.remove(&record.container_id).await;
        if let Err(e) = &container {
            tracing::error!(server_id, container = %record.container_id, error = %e, "Failed to remove container");
        }
        let world = self.volumes.remove(record.port);
        if let Err(e) = &world {
            tracing::error!(server_id, port = record.port, error = %e, "Failed to delete world");
        }

        if container.is_ok() && world.is_ok() {
            self.ports.release(record.port);
            self.vault.unbind(&record.container_id);
        }

        Ok(TeardownReport {
            server_id: server_id.to_string(),
            container_id: record.container_id,
            port: record.port,
            container,
            world,
        })
    }
}
