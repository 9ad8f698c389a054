//! Pool manager - the single lookup path over live containers
//!
//! Nothing is cached: every query lists the runtime and fuses name and pause
//! state into a status at read time.

use std::sync::Arc;

use crate::credentials::CredentialVault;
use crate::models::{ContainerRecord, ContainerStatus, SearchFilter};
use crate::naming::{ContainerKind, NamingScheme};
use crate::runtime::ContainerRuntime;
use crate::Result;

pub struct PoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingScheme,
    vault: Arc<CredentialVault>,
    default_ram_mb: u32,
}

impl PoolManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        naming: NamingScheme,
        vault: Arc<CredentialVault>,
        default_ram_mb: u32,
    ) -> Self {
        Self {
            runtime,
            naming,
            vault,
            default_ram_mb,
        }
    }

    /// Live containers matching the filter
    pub async fn find(&self, filter: &SearchFilter) -> Result<Vec<ContainerRecord>> {
        self.scan(filter, false).await
    }

    /// With `any_pause_state`, a Running filter also matches paused assigned
    /// containers.
    async fn scan(&self, filter: &SearchFilter, any_pause_state: bool) -> Result<Vec<ContainerRecord>> {
        let warm = match filter.status {
            ContainerStatus::Prepared | ContainerStatus::Preparing => true,
            ContainerStatus::Running => false,
            // Stopped servers have no live container
            ContainerStatus::Stopped => return Ok(Vec::new()),
        };
        let prefix = if warm {
            self.naming.warm_prefix()
        } else {
            self.naming.server_prefix()
        };

        let mut records = Vec::new();
        for container in self.runtime.list_by_name_prefix(prefix).await? {
            // The warm prefix extends the server prefix, so both listings
            // need the name classified.
            let server_id = match self.naming.classify(&container.name) {
                ContainerKind::Warm(_) if warm => None,
                ContainerKind::Assigned(server_id) if !warm => Some(server_id),
                _ => continue,
            };

            let Some(mc_version) = self.naming.version_from_image(&container.image) else {
                continue;
            };
            if filter.mc_version.as_ref().is_some_and(|v| *v != mc_version) {
                continue;
            }

            let details = match self.runtime.inspect(&container.id).await {
                Ok(details) => details,
                Err(e) => {
                    // Removed between list and inspect
                    tracing::debug!(container = %container.id, error = %e, "Skipping container");
                    continue;
                }
            };

            let status = ContainerStatus::derive(warm, details.paused);
            let matches = match filter.status {
                ContainerStatus::Running => any_pause_state || !details.paused,
                requested => status == requested,
            };
            if !matches {
                continue;
            }

            let ram_mb = details.ram_mb().unwrap_or(self.default_ram_mb);
            if filter.ram_mb.is_some_and(|mb| mb != ram_mb) {
                continue;
            }

            let Some(port) = container.public_port.or(details.published_port) else {
                continue;
            };

            records.push(ContainerRecord {
                auth_key: self.vault.lookup(&container.id),
                container_id: container.id,
                name: container.name,
                server_id,
                mc_version,
                port,
                ram_mb,
                status: filter.status,
            });
        }
        Ok(records)
    }

    /// The container, if it is currently Prepared
    pub async fn find_prepared(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .find(&SearchFilter::prepared())
            .await?
            .into_iter()
            .find(|r| r.container_id == container_id))
    }

    /// The live Running container of a server
    pub async fn find_running(&self, server_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .find(&SearchFilter::running())
            .await?
            .into_iter()
            .find(|r| r.server_id.as_deref() == Some(server_id)))
    }

    /// The live container of a server, paused or not
    pub async fn find_assigned(&self, server_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .scan(&SearchFilter::running(), true)
            .await?
            .into_iter()
            .find(|r| r.server_id.as_deref() == Some(server_id)))
    }
}
