//! Persisted server model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContainerRecord, ContainerStatus};

/// A server that should be running, as recorded in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredServer {
    /// Stable identity that survives container re-creation
    pub server_id: String,
    /// Human-readable name
    pub name: String,
    /// Last known runtime container ID
    pub container_id: String,
    pub mc_version: String,
    pub port: u16,
    pub ram_mb: u32,
    /// Owning user, if any
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredServer {
    pub fn new(name: impl Into<String>, record: &ContainerRecord) -> Self {
        Self {
            server_id: record.server_id.clone().unwrap_or_default(),
            name: name.into(),
            container_id: record.container_id.clone(),
            mc_version: record.mc_version.clone(),
            port: record.port,
            ram_mb: record.ram_mb,
            owner: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }
}

/// Client-facing view of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub name: String,
    pub container_id: String,
    pub mc_version: String,
    pub port: u16,
    pub ram_mb: u32,
    pub status: ContainerStatus,
}

impl ServerInfo {
    pub fn from_record(name: impl Into<String>, record: &ContainerRecord) -> Self {
        Self {
            server_id: record.server_id.clone().unwrap_or_default(),
            name: name.into(),
            container_id: record.container_id.clone(),
            mc_version: record.mc_version.clone(),
            port: record.port,
            ram_mb: record.ram_mb,
            status: record.status,
        }
    }
}
