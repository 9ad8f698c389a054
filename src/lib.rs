//! Minecraft Server Warm-Pool Orchestrator
//!
//! Keeps a pool of paused, fully booted game server containers so that a
//! request for a new server can be answered instantly. A request that misses
//! the pool is prepared in the background and reports progress over a
//! per-server channel.
//!
//! # Key Features
//!
//! - **Instant servers** - Prepared containers are renamed and unpaused, nothing else
//! - **Self-healing startup** - Unfinished containers are cleaned up and stored servers restored
//! - **Unbounded retry** - Image pulls and container creation never give up
//!
//! # Example
//!
//! ```no_run
//! use mc_pool::{Orchestrator, OrchestratorConfig, ProvisionRequest, Provisioned};
//!
//! # async fn run() -> mc_pool::Result<()> {
//! let orchestrator = Orchestrator::connect(OrchestratorConfig::new().data_dir("/srv/mc"))?;
//! orchestrator.reconcile().await?;
//!
//! let request = ProvisionRequest::new("survival", "1.19.3").ram_mb(2048);
//! match orchestrator.provision(request).await? {
//!     Provisioned::Ready(server) => println!("ready on port {}", server.port),
//!     Provisioned::Preparing { progress, .. } => {
//!         progress.follow(|message| println!("{}", message)).await;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod ports;
pub mod progress;
pub mod reconcile;
pub mod runtime;
pub mod volumes;

#[cfg(test)]
mod testing;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, ProvisionRequest, Provisioned};
