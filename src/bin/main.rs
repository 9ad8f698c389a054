//! mc-pool CLI - warm-pool orchestrator for Minecraft server containers

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use mc_pool::lifecycle::TeardownReport;
use mc_pool::{Orchestrator, OrchestratorConfig, ProvisionRequest, Provisioned, Result};
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "mc-pool")]
#[command(about = "Warm-pool orchestrator for containerized Minecraft servers")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "MC_POOL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database and worlds), overrides the config file
    #[arg(long, global = true, env = "MC_POOL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile, then keep warming and restore jobs running until Ctrl-C
    Run,
    /// Reconcile and wait for restored servers to boot
    Reconcile,
    /// List prepared containers in the warm pool
    Pool,
    /// List running servers
    Servers,
    /// Request a new server
    Provision {
        /// Server name
        #[arg(short, long)]
        name: String,
        /// Minecraft version
        #[arg(short, long)]
        version: String,
        /// RAM in MB
        #[arg(short, long)]
        ram: Option<u32>,
        /// Owning user
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Delete a server and its world
    Delete {
        /// Server ID
        server_id: String,
    },
    /// Prepare warm containers and wait for them
    Warm {
        /// Minecraft version
        #[arg(short, long)]
        version: String,
        /// RAM in MB
        #[arg(short, long)]
        ram: Option<u32>,
        /// Number of containers
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
    /// Stream resource usage of a server as JSON lines
    Stats {
        /// Server ID
        server_id: String,
        /// Stop after this many samples
        #[arg(short = 'n', long)]
        samples: Option<usize>,
    },
}

#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "RAM")]
    ram: String,
}

#[derive(Tabled)]
struct ServerRow {
    #[tabled(rename = "Server ID")]
    server_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "RAM")]
    ram: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config = config.data_dir(data_dir);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mc_pool=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let orch = Orchestrator::connect(config)?;

    match cli.command {
        Commands::Run => {
            let report = orch.reconcile().await?;
            println!(
                "Reconciled: {} warm, {} removed, {} reattached, {} restoring",
                report.warm_containers, report.removed_orphans, report.reattached, report.restored
            );
            println!("Running. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            println!("Shutting down.");
        }
        Commands::Reconcile => {
            println!("Reconciling with the container runtime...");
            let report = orch.reconcile().await?;
            for job in report.jobs {
                match job.await {
                    Ok(record) => println!("  - {} ready on port {}", record.name, record.port),
                    Err(e) => eprintln!("  - preparation task failed: {}", e),
                }
            }
            println!("Done.");
        }
        Commands::Pool => {
            let prepared = orch.prepared().await?;
            if prepared.is_empty() {
                println!("No prepared containers.");
                return Ok(());
            }

            let rows: Vec<PoolRow> = prepared
                .iter()
                .map(|r| PoolRow {
                    container: short_id(&r.container_id),
                    name: r.name.clone(),
                    version: r.mc_version.clone(),
                    port: r.port,
                    ram: format!("{}MB", r.ram_mb),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        Commands::Servers => {
            let servers = orch.running_servers().await?;
            if servers.is_empty() {
                println!("No running servers.");
                return Ok(());
            }

            let rows: Vec<ServerRow> = servers
                .iter()
                .map(|s| ServerRow {
                    server_id: s.server_id.clone(),
                    name: s.name.clone(),
                    version: s.mc_version.clone(),
                    port: s.port,
                    ram: format!("{}MB", s.ram_mb),
                    status: s.status.to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        Commands::Provision {
            name,
            version,
            ram,
            owner,
        } => {
            orch.adopt().await?;
            let mut request = ProvisionRequest::new(&name, &version);
            request.ram_mb = ram;
            request.owner = owner;

            match orch.provision(request).await? {
                Provisioned::Ready(server) => {
                    println!("Server {} ready: {} on port {}", server.server_id, server.name, server.port);
                }
                Provisioned::Preparing {
                    server_id,
                    progress,
                    handle,
                    ..
                } => {
                    println!("Preparing server {}...", server_id);
                    progress.follow(|message| println!("  {}", message)).await;
                    match handle.await {
                        Ok(record) => println!("Server {} running on port {}", server_id, record.port),
                        Err(e) => eprintln!("Preparation task failed: {}", e),
                    }
                }
            }
        }
        Commands::Delete { server_id } => {
            orch.adopt().await?;
            let report = orch.delete_server(&server_id).await?;
            print_teardown(&report);
        }
        Commands::Warm { version, ram, count } => {
            orch.adopt().await?;
            let jobs = orch.warm(&version, ram, count)?;
            println!("Preparing {} container(s) for {}...", jobs.len(), version);
            orch.wait_version_idle(&version).await;
            for job in jobs {
                if let Ok(record) = job.await {
                    println!("  - {} on port {}", record.name, record.port);
                }
            }
            println!("Done.");
        }
        Commands::Stats { server_id, samples } => {
            let stream = orch.stats(&server_id).await?;
            let mut stream = match samples {
                Some(n) => stream.take(n).boxed(),
                None => stream,
            };
            while let Some(sample) = stream.next().await {
                println!("{}", serde_json::to_string(&sample)?);
            }
        }
    }

    Ok(())
}

fn print_teardown(report: &TeardownReport) {
    println!("Server {} (port {}):", report.server_id, report.port);
    match &report.container {
        Ok(()) => println!("  container removed"),
        Err(e) => println!("  container: {}", e),
    }
    match &report.world {
        Ok(()) => println!("  world deleted"),
        Err(e) => println!("  world: {}", e),
    }
    if report.is_complete() {
        println!("Deleted.");
    } else {
        println!("Incomplete; the server record was kept so the delete can be retried.");
    }
}
