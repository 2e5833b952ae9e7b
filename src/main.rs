//! haplane - High Availability for a Management Plane
//!
//! Runs one management node, or queries a running one.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use haplane::api::HaNodesResponse;
use haplane::config::HaPlaneConfig;
use haplane::error::{Error, Result};
use haplane::node::{open_store, ManagementNode};

/// haplane - High Availability for a Management Plane
#[derive(Parser)]
#[command(name = "haplane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "haplane.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a management node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "haplane.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "mgmt-1")]
        node_id: String,

        /// HA mode (disabled, auto, hot_standby, hot_backup)
        #[arg(long, default_value = "hot_standby")]
        mode: String,
    },

    /// Validate configuration file
    Validate,

    /// Show the HA state of a running node
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8081")]
        address: String,
    },

    /// Show every node's heartbeat as seen through a running node
    Nodes {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8081")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config file may set the level for `start`
    let file_level = match cli.command {
        Commands::Start => HaPlaneConfig::from_file(&cli.config)
            .ok()
            .map(|c| c.logging.level),
        _ => None,
    };
    let level = cli
        .log_level
        .clone()
        .or(file_level)
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            node_id,
            mode,
        } => run_init(output, node_id, mode),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { address } => run_status(address).await,
        Commands::Nodes { address } => run_nodes(address).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a management node and run until Ctrl-C
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match HaPlaneConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let store = match open_store(&config.store) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to open shared store: {}", e);
            return Err(e);
        }
    };

    let node = ManagementNode::new(config, store);
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    node.shutdown().await;
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, mode: String) -> Result<()> {
    let config_content = format!(
        r#"# haplane Configuration
# Generated configuration file

[node]
id = "{node_id}"

[ha]
# disabled, auto, hot_standby or hot_backup
mode = "{mode}"
heartbeat_interval_ms = 1000
liveness_timeout_ms = 4000
claim_jitter_ms = 200
replication_interval_ms = 1000
persist_interval_ms = 100

[store]
backend = "sqlite"
# Must be the same file for every node of the cluster
path = "/var/lib/haplane/shared/store.db"

[api]
enabled = true
bind_address = "0.0.0.0:8081"
cors_enabled = false

[admission]
always_allowed = ["/health", "/server/ha"]
read_only_paths = []
startup_wait_ms = 5000

[logging]
level = "info"
"#
    );

    // Reject a mode typo before writing the file
    HaPlaneConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: haplane start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match HaPlaneConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:          {}", config.node.id);
            println!("  HA Mode:          {}", config.ha.mode);
            println!("  Heartbeat:        {} ms", config.ha.heartbeat_interval_ms);
            println!("  Liveness Timeout: {} ms", config.ha.liveness_timeout_ms);
            println!("  Store:            {:?} {}", config.store.backend, config.store.path.display());
            println!("  API:              {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    response
        .json::<T>()
        .await
        .map_err(|e| Error::Network(e.to_string()))
}

/// Show a node's HA state
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/server/ha/state", address);
    match fetch_json::<serde_json::Value>(&url).await {
        Ok(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(e)
        }
    }
}

/// Show all heartbeats known to the shared store
async fn run_nodes(address: String) -> Result<()> {
    let url = format!("http://{}/server/ha/nodes", address);
    let view: HaNodesResponse = match fetch_json(&url).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Failed to get nodes: {}", e);
            return Err(e);
        }
    };

    match &view.leadership {
        Some(l) => println!("Master: {} (epoch {}, claimed {})", l.master_id, l.epoch, l.claimed_at),
        None => println!("Master: none"),
    }
    println!();
    println!("{:<20} {:<12} {:<8} {}", "NODE", "STATE", "EPOCH", "LAST HEARTBEAT");
    for node in &view.nodes {
        let seen = chrono::DateTime::from_timestamp_millis(node.timestamp_ms as i64)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| node.timestamp_ms.to_string());
        let epoch = node.epoch.map(|e| e.to_string()).unwrap_or_else(|| "-".into());
        println!("{:<20} {:<12} {:<8} {}", node.node_id, node.state.to_string(), epoch, seen);
    }
    Ok(())
}
