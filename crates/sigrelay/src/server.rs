use crate::config::ServerConfig;
use crate::connection::{client_ws, server_ws};
use crate::error::RelayError;
use crate::page::index;
use crate::router::RouterHandle;
use axum::routing::get;
use dashmap::DashMap;
use std::future::{Future, IntoFuture};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for the relay server.
pub struct ServerState {
    /// Intake of the router task that owns the peer registry.
    pub router: RouterHandle,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Number of connections currently holding a slot.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Create state around a running router.
    #[must_use]
    pub fn new(config: ServerConfig, router: RouterHandle) -> Self {
        Self {
            router,
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Routes: the bootstrap page at `/`, the server role at `/wssrv` and
/// clients at `/ws`.
pub fn app(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(index))
        .route("/ws", get(client_ws))
        .route("/wssrv", get(server_ws))
        .with_state(state)
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Serve until `shutdown` resolves.
///
/// Shutdown only stops accepting. Upgraded connections keep running on their
/// own tasks until they end or the process exits.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send,
{
    let local_addr = listener.local_addr()?;
    info!("relay listening on {}", local_addr);

    let service = app(state).into_make_service_with_connect_info::<SocketAddr>();
    tokio::select! {
        result = axum::serve(listener, service).into_future() => result?,
        () = shutdown => info!("shutdown signal received, no longer accepting"),
    }
    Ok(())
}
