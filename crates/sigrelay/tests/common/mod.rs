#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use sigrelay::config::ServerConfig;
use sigrelay::router::{Router, DEFAULT_INTAKE_CAPACITY};
use sigrelay::server::ServerState;
use sigrelay_common::Envelope;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub fn test_config(bind: SocketAddr) -> ServerConfig {
    ServerConfig {
        bind,
        endpoint: bind.to_string(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_frame_size: 65_536,
        mailbox_capacity: 256,
        idle_timeout: 60,
        write_timeout: 10,
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);

    let (router, _task) = Router::spawn(DEFAULT_INTAKE_CAPACITY);
    let state = Arc::new(ServerState::new(config, router));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sigrelay::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub struct TestPeer {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestPeer {
    /// Connects to `path` (`/ws` or `/wssrv`) and waits for registration to land.
    pub async fn connect(addr: &SocketAddr, path: &str) -> Self {
        let url = format!("ws://{addr}{path}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { ws }
    }

    pub async fn server(addr: &SocketAddr) -> Self {
        Self::connect(addr, "/wssrv").await
    }

    pub async fn client(addr: &SocketAddr) -> Self {
        Self::connect(addr, "/ws").await
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) {
        let text = envelope.to_json().unwrap();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        self.recv_envelope_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for envelope")
    }

    pub async fn recv_envelope_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()?;
            match msg.unwrap().unwrap() {
                Message::Text(text) => return Some(Envelope::parse(text.as_bytes()).unwrap()),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Waits for the relay to end the connection, ignoring keepalive traffic.
    pub async fn expect_closed(&mut self) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(other)) => panic!("expected close, got {other:?}"),
                }
            }
        })
        .await;
        assert!(result.is_ok(), "connection was not closed");
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.unwrap();
    }
}
