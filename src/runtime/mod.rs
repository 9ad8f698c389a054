//! Container runtime adapter
//!
//! The only seam that talks to the container runtime. Every call blocks the
//! calling task until the runtime answers; other tasks are unaffected.

mod docker;

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use docker::DockerRuntime;

/// Environment key carrying the agent auth token
pub const AUTH_ENV_KEY: &str = "auth";
/// Environment key carrying the target RAM in MB
pub const RAM_ENV_KEY: &str = "ram";
/// Keeps the agent from booting the game world on container start
pub const AUTOSTART_DISABLED_ENV: &str = "autostart=false";

/// A container as reported by a runtime listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    /// Name without the runtime's leading `/`
    pub name: String,
    pub image: String,
    pub public_port: Option<u16>,
}

/// Inspection result for a single container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub published_port: Option<u16>,
    pub paused: bool,
}

impl ContainerDetails {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    pub fn auth_key(&self) -> Option<&str> {
        self.env_value(AUTH_ENV_KEY)
    }

    pub fn ram_mb(&self) -> Option<u32> {
        self.env_value(RAM_ENV_KEY)?.parse().ok()
    }
}

/// Everything needed to create a server container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: Vec<String>,
    /// Host directory bind-mounted as the world
    pub world_path: PathBuf,
    pub world_mount_target: String,
    pub memory_bytes: i64,
}

impl CreateSpec {
    /// Memory limit for a RAM size in MB (decimal megabytes)
    pub fn memory_for(ram_mb: u32) -> i64 {
        i64::from(ram_mb) * 1_000_000
    }

    /// Container environment: autostart disabled, auth token, target RAM
    pub fn server_env(auth_key: &str, ram_mb: u32) -> Vec<String> {
        vec![
            AUTOSTART_DISABLED_ENV.to_string(),
            format!("{}={}", AUTH_ENV_KEY, auth_key),
            format!("{}={}", RAM_ENV_KEY, ram_mb),
        ]
    }
}

/// One resource usage sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "cpu_usage_percent")]
    pub cpu_percent: f64,
    pub memory_usage_mb: f64,
    pub max_memory_usage_mb: f64,
}

impl ContainerStats {
    /// Build a sample from cumulative CPU counters and memory in bytes
    pub fn from_usage(container_cpu: u64, system_cpu: u64, memory: u64, max_memory: u64) -> Self {
        let cpu_percent = if container_cpu == 0 || system_cpu == 0 {
            0.0
        } else {
            container_cpu as f64 * 100.0 / system_cpu as f64
        };
        Self {
            cpu_percent,
            memory_usage_mb: memory as f64 / 1_000_000.0,
            max_memory_usage_mb: max_memory as f64 / 1_000_000.0,
        }
    }
}

/// Lazy, non-restartable sequence of samples. Ends when the underlying
/// stream closes or on the first decode error.
pub type StatsStream = BoxStream<'static, ContainerStats>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Live (running or paused) containers
    async fn list(&self) -> Result<Vec<RuntimeContainer>>;

    async fn list_by_name_prefix(&self, prefix: &str) -> Result<Vec<RuntimeContainer>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.name.starts_with(prefix))
            .collect())
    }

    /// Create (but do not start) a container, returning its ID
    async fn create(&self, spec: &CreateSpec) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    async fn pause(&self, container_id: &str) -> Result<()>;

    async fn unpause(&self, container_id: &str) -> Result<()>;

    async fn rename(&self, container_id: &str, name: &str) -> Result<()>;

    /// Force-remove a container together with its anonymous volumes
    async fn remove(&self, container_id: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails>;

    async fn stream_stats(&self, container_id: &str) -> Result<StatsStream>;

    /// Block until the image is available locally. Failures are retried
    /// indefinitely at a fixed interval; this never gives up.
    async fn pull_image(&self, image: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_lookup() {
        let details = ContainerDetails {
            env: CreateSpec::server_env("k3y=with=equals", 1024),
            published_port: Some(30001),
            paused: true,
        };
        assert_eq!(details.env_value("autostart"), Some("false"));
        assert_eq!(details.auth_key(), Some("k3y=with=equals"));
        assert_eq!(details.ram_mb(), Some(1024));
        assert_eq!(details.env_value("missing"), None);
    }

    #[test]
    fn test_memory_limit_is_decimal() {
        assert_eq!(CreateSpec::memory_for(1024), 1_024_000_000);
    }

    #[test]
    fn test_stats_from_usage() {
        let stats = ContainerStats::from_usage(50, 200, 512_000_000, 1_024_000_000);
        assert_eq!(stats.cpu_percent, 25.0);
        assert_eq!(stats.memory_usage_mb, 512.0);
        assert_eq!(stats.max_memory_usage_mb, 1024.0);

        let idle = ContainerStats::from_usage(0, 200, 0, 0);
        assert_eq!(idle.cpu_percent, 0.0);
    }

    #[test]
    fn test_stats_json_keys() {
        let json = serde_json::to_value(ContainerStats::from_usage(1, 2, 0, 0)).unwrap();
        assert!(json.get("cpu_usage_percent").is_some());
        assert!(json.get("memory_usage_mb").is_some());
        assert!(json.get("max_memory_usage_mb").is_some());
    }
}
