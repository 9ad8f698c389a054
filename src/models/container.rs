//! Container record model - mirrored from the runtime on every query

use serde::{Deserialize, Serialize};

/// Lifecycle status derived from a container's name and pause state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Warm-pool container, world generated, paused
    Prepared,
    /// Warm-pool container still being prepared
    Preparing,
    /// Assigned server container
    Running,
    /// Known server without a live container
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Prepared => write!(f, "Prepared"),
            ContainerStatus::Preparing => write!(f, "Preparing"),
            ContainerStatus::Running => write!(f, "Running"),
            ContainerStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ContainerStatus {
    /// Fuse the two runtime signals into a status. `warm` is whether the name
    /// follows the warm-pool convention.
    pub fn derive(warm: bool, paused: bool) -> Self {
        match (warm, paused) {
            (true, true) => ContainerStatus::Prepared,
            (true, false) => ContainerStatus::Preparing,
            (false, _) => ContainerStatus::Running,
        }
    }
}

/// A managed container as currently seen by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Runtime-assigned container ID
    pub container_id: String,
    /// Container name without the runtime's leading `/`
    pub name: String,
    /// Stable server identity; `None` for warm-pool containers
    pub server_id: Option<String>,
    pub mc_version: String,
    pub port: u16,
    pub ram_mb: u32,
    /// Cross-referenced from the credential vault
    pub auth_key: Option<String>,
    pub status: ContainerStatus,
}

/// Filter for pool lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub status: ContainerStatus,
    pub mc_version: Option<String>,
    pub ram_mb: Option<u32>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self::prepared()
    }
}

impl SearchFilter {
    pub fn prepared() -> Self {
        Self {
            status: ContainerStatus::Prepared,
            mc_version: None,
            ram_mb: None,
        }
    }

    pub fn running() -> Self {
        Self {
            status: ContainerStatus::Running,
            ..Self::prepared()
        }
    }

    pub fn with_status(mut self, status: ContainerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.mc_version = Some(version.into());
        self
    }

    pub fn ram_mb(mut self, mb: u32) -> Self {
        self.ram_mb = Some(mb);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        assert_eq!(ContainerStatus::derive(true, true), ContainerStatus::Prepared);
        assert_eq!(ContainerStatus::derive(true, false), ContainerStatus::Preparing);
        assert_eq!(ContainerStatus::derive(false, false), ContainerStatus::Running);
        assert_eq!(ContainerStatus::derive(false, true), ContainerStatus::Running);
    }

    #[test]
    fn test_default_filter_is_prepared() {
        let filter = SearchFilter::default();
        assert_eq!(filter.status, ContainerStatus::Prepared);
        assert!(filter.mc_version.is_none());
        assert!(filter.ram_mb.is_none());
    }

    #[test]
    fn test_filter_builder() {
        let filter = SearchFilter::running().version("1.19.3").ram_mb(1024);
        assert_eq!(filter.status, ContainerStatus::Running);
        assert_eq!(filter.mc_version.as_deref(), Some("1.19.3"));
        assert_eq!(filter.ram_mb, Some(1024));
    }
}
