//! Orchestrator configuration with builder pattern and TOML loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Game versions with a published image, newest first
pub const AVAILABLE_VERSIONS: &[&str] = &[
    "1.19.3", "1.19.2", "1.19", "1.18.2", "1.18", "1.17", "1.16.5", "1.16", "1.15.2", "1.15",
    "1.14.4", "1.14", "1.13.2", "1.13", "1.12.2", "1.12", "1.11.2", "1.11", "1.10.2", "1.9.4",
    "1.9", "1.8.9", "1.8", "1.7.10", "1.7",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root for the database and world directories
    pub data_dir: PathBuf,
    /// World directories live under `data_dir/worlds_dir/<port>`
    pub worlds_dir: String,
    pub database_file: String,
    pub default_ram_mb: u32,
    pub max_ram_mb: u32,
    /// Supported versions; the first entry is the default for pool warming
    pub versions: Vec<String>,
    /// Fixed delay between retries of transient failures
    pub retry_delay_ms: u64,
    /// Warm containers kept per version/RAM after a pool hit
    pub min_warm: usize,
    pub image: ImageConfig,
    pub naming: NamingConfig,
    pub ports: PortRange,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub base_image: String,
    pub version_separator: String,
    /// Port the agent listens on inside the container
    pub container_port: u16,
    pub world_mount_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub server_prefix: String,
    pub warm_prefix: String,
}

/// Half-open host port range `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub request_timeout_ms: u64,
    /// Upper bound for the blocking world start call
    pub start_timeout_ms: u64,
    /// How long a fresh container may take before its agent answers
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            worlds_dir: "worlds".to_string(),
            database_file: "data.db".to_string(),
            default_ram_mb: 2048,
            max_ram_mb: 8192,
            versions: AVAILABLE_VERSIONS.iter().map(|v| v.to_string()).collect(),
            retry_delay_ms: 2000,
            min_warm: 1,
            image: ImageConfig::default(),
            naming: NamingConfig::default(),
            ports: PortRange::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_image: "ghcr.io/instantminecraft/client".to_string(),
            version_separator: ":mc-".to_string(),
            container_port: 25585,
            world_mount_target: "/server/world".to_string(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            server_prefix: "MC-Server-".to_string(),
            warm_prefix: "MC-Server-ready".to_string(),
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { min: 30000, max: 40000 }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            request_timeout_ms: 10_000,
            start_timeout_ms: 600_000,
            ready_timeout_ms: 120_000,
            poll_interval_ms: 1000,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file; missing keys fall back to defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.ports = PortRange { min, max };
        self
    }

    pub fn default_ram_mb(mut self, mb: u32) -> Self {
        self.default_ram_mb = mb;
        self
    }

    pub fn versions(mut self, versions: &[&str]) -> Self {
        self.versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn min_warm(mut self, n: usize) -> Self {
        self.min_warm = n;
        self
    }

    pub fn agent_host(mut self, host: impl Into<String>) -> Self {
        self.agent.host = host.into();
        self
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Version used when the pool is warmed without an explicit request
    pub fn default_version(&self) -> &str {
        self.versions.first().map(String::as_str).unwrap_or(AVAILABLE_VERSIONS[0])
    }

    pub fn is_supported_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    pub fn worlds_path(&self) -> PathBuf {
        self.data_dir.join(&self.worlds_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.versions.is_empty() {
            return Err(Error::Config("at least one version must be configured".into()));
        }
        if self.ports.min >= self.ports.max {
            return Err(Error::Config(format!(
                "port range is empty: [{}, {})",
                self.ports.min, self.ports.max
            )));
        }
        if self.default_ram_mb == 0 || self.default_ram_mb > self.max_ram_mb {
            return Err(Error::Config(format!(
                "default ram {}MB must be between 1 and {}MB",
                self.default_ram_mb, self.max_ram_mb
            )));
        }
        if self.naming.server_prefix.is_empty() || self.naming.warm_prefix.is_empty() {
            return Err(Error::Config("container name prefixes cannot be empty".into()));
        }
        if self.naming.server_prefix == self.naming.warm_prefix {
            return Err(Error::Config("warm and server prefixes must differ".into()));
        }
        Ok(())
    }
}
