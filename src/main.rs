//! Edge gateway binary.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!   Client ──────▶│ rate limit ─▶ route ─▶ cache? ─▶ breaker ─▶ registry │
//!                 │                                    │                 │
//!                 │                      balancer ◀────┘                 │
//!                 │                          │                           │
//!   Client ◀──────│◀──── response ◀──── forward (proxy / typed call) ◀───┼──── Backend
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use edge_gateway::config::{load_config, watcher::ConfigWatcher, GatewayConfig};
use edge_gateway::lifecycle::{signals, Gateway, Shutdown, StartupError};
use edge_gateway::observability::{logging, metrics};
use edge_gateway::GatewayServer;

#[derive(Debug, Parser)]
#[command(name = "edge-gateway", version, about = "Service-discovering edge gateway")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    logging::init(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        services = config.services.len(),
        "edge-gateway starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let bind_address = config.listener.bind_address.clone();
    let gateway = std::sync::Arc::new(Gateway::bootstrap(config).await?);
    let shutdown = Shutdown::new();
    let refresher = gateway.spawn_background(&shutdown);

    // Hot reload of service seeds
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let gateway = gateway.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(new_config) = updates.recv() => gateway.apply_reload(&new_config),
                        _ = stop.recv() => break,
                        else => break,
                    }
                }
            });
            match watcher.run() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let server = GatewayServer::new(&gateway)?;
    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: bind_address.clone(),
            source,
        })?;

    let server_shutdown = shutdown.subscribe();
    let server_task = tokio::spawn(server.run(listener, server_shutdown));

    signals::shutdown_signal().await;
    shutdown.trigger();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Server exited with error"),
        Err(e) => tracing::error!(error = %e, "Server task panicked"),
    }
    let _ = refresher.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
