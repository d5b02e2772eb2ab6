use crate::metrics::counters;
use crate::peer::{Keepalive, Peer};
use crate::server::ServerState;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sigrelay_common::Role;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// `GET /wssrv`: upgrade into the privileged server role.
pub async fn server_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    accept(ws, addr, state, Role::Server)
}

/// `GET /ws`: upgrade into an ordinary client.
pub async fn client_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    accept(ws, addr, state, Role::Client)
}

fn accept(ws: WebSocketUpgrade, addr: SocketAddr, state: Arc<ServerState>, role: Role) -> Response {
    let guard = match ConnGuard::acquire(&state, addr.ip()) {
        Ok(guard) => guard,
        Err(rejection) => return rejection.into_response(),
    };

    let max = state.config.max_frame_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_connection(socket, role, state, guard))
}

async fn handle_connection(
    socket: WebSocket,
    role: Role,
    state: Arc<ServerState>,
    guard: ConnGuard,
) {
    let (peer, handle) = Peer::new(role, state.config.mailbox_capacity);
    let id = peer.id();
    debug!(peer = %id, role = %role, ip = %guard.ip, "connection upgraded");

    // Registration must land before the read loop can dispatch anything.
    if let Err(e) = state.router.register(handle).await {
        error!(peer = %id, error = %e, "cannot register peer");
        return;
    }

    peer.run(socket, &state.router, Keepalive::from(&state.config)).await;
    drop(guard);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    ServerFull,
    TooManyFromIp,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Self::ServerFull => {
                (StatusCode::SERVICE_UNAVAILABLE, "relay is at capacity").into_response()
            }
            Self::TooManyFromIp => (
                StatusCode::TOO_MANY_REQUESTS,
                "too many connections from this address",
            )
                .into_response(),
        }
    }
}

/// Holds one slot of the global and per-IP connection budgets until dropped.
struct ConnGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl ConnGuard {
    fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Result<Self, Rejection> {
        let max_conns = state.config.max_conns;
        if state
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_conns).then_some(n + 1)
            })
            .is_err()
        {
            warn!(ip = %ip, limit = max_conns, "max connections reached");
            counters::connections_rejected_total("capacity");
            return Err(Rejection::ServerFull);
        }

        // Entry API keeps the check and the increment atomic per IP.
        let admitted = match state.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    false
                } else {
                    *entry.get_mut() += 1;
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(1);
                true
            }
        };

        if !admitted {
            state.active_connections.fetch_sub(1, Ordering::AcqRel);
            debug!(ip = %ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
            counters::connections_rejected_total("per_ip");
            return Err(Rejection::TooManyFromIp);
        }

        Ok(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
