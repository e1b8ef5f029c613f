//! WolfRoute - Change Routing Engine for Multi-Node Database Sync
//!
//! Command line entry point: runs the routing service or inspects its
//! store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfroute::config::RouterServiceConfig;
use wolfroute::platform;
use wolfroute::store::Store;
use wolfroute::RouterService;

/// WolfRoute - Change Routing Engine
#[derive(Parser)]
#[command(name = "wolfroute")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfroute.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route continuously until interrupted
    Run,

    /// Run a single routing cycle and print its report
    Route,

    /// Show the gap table
    Gaps {
        /// Include filled and skipped gaps
        #[arg(long)]
        all: bool,
    },

    /// Summarize outgoing batches per node
    Batches,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfroute.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "00000")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(&output, &node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(&cli.config)
        }
        command => {
            let config = RouterServiceConfig::from_file(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            init_logging(level, &config.logging.format);

            match command {
                Commands::Run => run_service(config).await,
                Commands::Route => run_route(config).await,
                Commands::Gaps { all } => run_gaps(config, all).await,
                Commands::Batches => run_batches(config).await,
                Commands::Info => run_info(&config),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_store(config: &RouterServiceConfig) -> anyhow::Result<Arc<Store>> {
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("opening store {}", config.database.path.display()))?;
    Ok(Arc::new(store))
}

async fn build_service(config: RouterServiceConfig) -> anyhow::Result<RouterService> {
    let store = open_store(&config)?;
    let visibility = platform::connect(&config).await?;
    tracing::info!(
        "Node {} ({}) routing {} channels, visibility from {}",
        config.node.id,
        config.node.group_id,
        config.channels.len(),
        visibility.name()
    );
    Ok(RouterService::new(config, store, visibility)?)
}

/// Route until ctrl-c
async fn run_service(config: RouterServiceConfig) -> anyhow::Result<()> {
    let interval = config.routing_interval();
    let service = build_service(config).await?;

    tracing::info!("Routing every {:?}", interval);
    service
        .run_until(interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;
    Ok(())
}

async fn run_route(config: RouterServiceConfig) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    let report = service.route_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_gaps(config: RouterServiceConfig, all: bool) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let gaps = if all { store.gaps().await? } else { store.active_gaps().await? };

    println!("{:>20} {:>20}  {:<3} {}", "START", "END", "ST", "CREATED");
    for gap in gaps {
        let end = if gap.is_open_ended() {
            "open".to_string()
        } else {
            gap.end_id.to_string()
        };
        println!(
            "{:>20} {:>20}  {:<3} {}",
            gap.start_id,
            end,
            gap.status.code(),
            gap.create_time.to_rfc3339()
        );
    }
    Ok(())
}

#[derive(Default)]
struct NodeTotals {
    batches: u64,
    events: u64,
    bytes: u64,
}

async fn run_batches(config: RouterServiceConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;

    let mut totals: BTreeMap<(String, String), NodeTotals> = BTreeMap::new();
    for batch in store.batches().await? {
        let entry = totals.entry((batch.node_id.clone(), batch.channel_id.clone())).or_default();
        entry.batches += 1;
        entry.events += batch.data_event_count;
        entry.bytes += batch.byte_count;
    }

    println!("{:<12} {:<16} {:>8} {:>10} {:>12}", "NODE", "CHANNEL", "BATCHES", "EVENTS", "BYTES");
    for ((node, channel), t) in totals {
        println!("{:<12} {:<16} {:>8} {:>10} {:>12}", node, channel, t.batches, t.events, t.bytes);
    }
    for channel in &config.channels {
        if let Some(last) = store.last_routed_id(&channel.id).await? {
            println!("Last routed id on {}: {}", channel.id, last);
        }
    }
    Ok(())
}

fn run_init(output: &Path, node_id: &str) -> anyhow::Result<()> {
    let config_content = format!(r#"# WolfRoute Configuration
# Generated configuration file

[node]
id = "{node_id}"
group_id = "corp"

[database]
path = "/var/lib/wolfroute/{node_id}/routing.db"
busy_timeout_ms = 5000

[platform]
kind = "sqlite"
# kind = "mariadb"
# host = "localhost"
# port = 3306
# user = "wolfroute"
# password = "changeme"

[routing]
interval_ms = 1000
peek_ahead_window = 100
take_timeout_ms = 30000
stale_gap_ms = 1200000
gap_retention_hours = 24

[logging]
level = "info"
format = "pretty"

[[channels]]
id = "default"
batch_algorithm = "default"
max_batch_size = 1000

[[routers]]
id = "corp_2_store"
type = "default"
source_group = "corp"
target_group = "store"

# [[routers]]
# id = "corp_2_store_by_id"
# type = "column"
# source_group = "corp"
# target_group = "store"
# expression = "STORE_ID=:EXTERNAL_ID"

# [[triggers]]
# id = "item"
# table = "ITEM"
# channel = "default"
# routers = ["corp_2_store"]
"#);

    std::fs::write(output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure channels, routers and triggers.");
    println!("Then start with: wolfroute --config {} run", output.display());

    Ok(())
}

fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match RouterServiceConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node: {} ({})", config.node.id, config.node.group_id);
            println!("  Store: {}", config.database.path.display());
            println!("  Channels: {}", config.channels.len());
            println!("  Routers: {}", config.routers.len());
            println!("  Triggers: {}", config.triggers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

fn run_info(config: &RouterServiceConfig) -> anyhow::Result<()> {
    println!("WolfRoute Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Node Group:       {}", config.node.group_id);
    println!("Store:            {}", config.database.path.display());
    println!("Platform:         {:?}", config.platform.kind);
    println!();
    println!("Routing:");
    println!("  Interval:       {} ms", config.routing.interval_ms);
    println!("  Peek Ahead:     {}", config.routing.peek_ahead_window);
    println!("  Stale Gap:      {} ms", config.routing.stale_gap_ms);
    println!();
    println!("Channels:");
    for channel in &config.channels {
        println!(
            "  {:<16} {} max {} per batch{}",
            channel.id,
            channel.batch_algorithm,
            channel.max_batch_size,
            if channel.enabled { "" } else { " (disabled)" }
        );
    }
    println!();
    println!("Routers:");
    for router in &config.routers {
        println!(
            "  {:<16} {:<20} {} -> {}",
            router.id, router.router_type, router.source_group, router.target_group
        );
    }

    Ok(())
}
