#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use sigrelay::config::{Args, ServerConfig};
use sigrelay::metrics::{start_metrics_server, HealthState};
use sigrelay::router::{Router, DEFAULT_INTAKE_CAPACITY};
use sigrelay::run;
use sigrelay::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let (router, mut router_task) = Router::spawn(DEFAULT_INTAKE_CAPACITY);
    let state = Arc::new(ServerState::new(config.clone(), router));

    let listener = TcpListener::bind(config.bind).await?;
    info!("bound to {}", config.bind);
    info!("bootstrap page points clients at {}", config.client_ws_url());

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        result = &mut router_task => {
            health_state.set_ready(false);
            anyhow::bail!("router task stopped: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
