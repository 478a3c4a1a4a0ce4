//! natprobe Node -- gateway NAT discovery daemon.
//!
//! Usage:
//!   natprobe-node                      # Run with default config
//!   natprobe-node --config path.toml   # Run with custom config
//!   natprobe-node show-config          # Print the effective config

use std::sync::Arc;

use clap::{Parser, Subcommand};
use natprobe_endpoint::LocalEndpoint;
use natprobe_node::config::NodeConfig;
use natprobe_node::discovery_task::{self, DirectoryEvent};
use natprobe_node::expand_tilde;
use natprobe_node::transport::{RouteSourceResolver, UdpTransport};
use natprobe_node::NatDiscovery;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser)]
#[command(name = "natprobe-node", about = "Gateway NAT discovery node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.natprobe/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "natprobe_node=info,natprobe_discovery=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await?,
        Some(Commands::ShowConfig) => println!("{}", toml::to_string_pretty(&cfg)?),
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let local_spec = cfg.local_endpoint()?;
    let bind_addr = cfg.discovery.bind_addr()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        local = %local_spec.identity(),
        bind = %bind_addr,
        family = %cfg.discovery.ip_family,
        remotes = cfg.remotes.len(),
        "starting natprobe-node"
    );

    let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let nd = NatDiscovery::new(
        LocalEndpoint::new(local_spec),
        transport,
        Arc::new(RouteSourceResolver),
        cfg.discovery.probe_timing(),
        cfg.discovery.ip_family,
        ready_tx,
    )?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (event_tx, event_rx) = mpsc::channel::<DirectoryEvent>(64);

    let discovery_handle = tokio::spawn(discovery_task::run_discovery_loop(
        nd,
        event_rx,
        cfg.discovery.tick_interval(),
        shutdown_tx.subscribe(),
    ));

    // Tunnel layer stand-in: report each resolved endpoint.
    let consumer_handle = tokio::spawn(async move {
        while let Some(info) = ready_rx.recv().await {
            println!(
                "{} {}:{} nat={} via={}",
                info.endpoint.cable_name,
                info.use_ip,
                info.use_port,
                info.use_nat,
                info.selected.map_or("fallback", |r| r.name()),
            );
        }
    });

    for remote in cfg.remotes {
        event_tx.send(DirectoryEvent::Added(remote)).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    if let Err(e) = discovery_handle.await {
        tracing::warn!("discovery task ended abnormally: {e}");
    }
    drop(event_tx);
    consumer_handle.abort();

    Ok(())
}
