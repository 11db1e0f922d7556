use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nerva_config::AppConfig;
use nerva_core::{Engine, Hub, payload};
use nerva_engines::{ContextEngine, NotesEngine, TrustEngine};
use nerva_gateway::{Gateway, GatewayPhase, probe};
use nerva_permissions::{PermissionManager, PermissionsEngine};

#[derive(Debug, Parser)]
#[command(name = "nerva", version, about = "Event-driven hub with a WebSocket event gateway")]
struct Cli {
    /// Configuration file (defaults to NERVA_CONFIG, then config/default.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Boot the engines and run the hub until interrupted.
    Serve,
    /// Print the effective configuration as TOML.
    Config,
    /// Wait until a running gateway accepts connections.
    Probe {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value_t = probe::DEFAULT_ATTEMPTS)]
        attempts: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Probe {
            host,
            port,
            attempts,
        } => {
            let host = host.unwrap_or(config.gateway.host);
            let port = port.unwrap_or(config.gateway.port);
            let addr = resolve(&host, port)?;
            if probe::wait_for_gateway(addr, attempts, probe::DEFAULT_INITIAL_DELAY) {
                println!("gateway at {addr} is accepting connections");
                Ok(())
            } else {
                bail!("gateway at {addr} did not answer after {attempts} attempts");
            }
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let data_dir = Path::new(&config.hub.data_dir);
    fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let hub = Hub::new();
    let manager = Arc::new(PermissionManager::new(&config.permissions, data_dir));
    let gateway = Gateway::new(&config.gateway, Some(manager.clone()));

    // Boot order is fixed and deterministic. The gateway goes last; anything
    // the earlier engines announce during boot lands in its pending queue
    // and reaches the first clients as backlog.
    let engines: Vec<Arc<dyn Engine>> = vec![
        PermissionsEngine::new(manager.clone()),
        ContextEngine::new(&config.context, data_dir),
        TrustEngine::new(),
        NotesEngine::new(&config.notes, data_dir),
        gateway.clone(),
    ];
    hub.boot(&engines);

    match gateway.wait_until_ready(Duration::from_secs(10)) {
        GatewayPhase::Listening => {
            if let Some(addr) = gateway.local_addr() {
                info!(%addr, "gateway ready");
            }
        }
        phase => warn!(?phase, "gateway is not listening; continuing without it"),
    }

    manager.audit_event("server_started", payload(json!({"name": config.hub.name})));
    hub.emit(
        "system.started",
        payload(json!({"component": "hub", "name": config.hub.name})),
    );
    info!(name = %config.hub.name, "hub running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    gateway.shutdown();
    hub.emit("system.stopped", payload(json!({"component": "hub"})));
    manager.audit_event("server_stopped", payload(json!({"name": config.hub.name})));
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}
