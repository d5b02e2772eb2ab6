use clap::Parser;
use sigrelay_common::types::DEFAULT_MAILBOX_CAPACITY;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sigrelay")]
#[command(about = "WebRTC signaling relay")]
#[command(version)]
pub struct Args {
    /// Socket address to accept connections on.
    #[arg(long, default_value = "127.0.0.1:8080", env = "SIGRELAY_BIND")]
    pub bind: SocketAddr,
    /// Host and port advertised to browsers for the client WebSocket.
    #[arg(long, default_value = "127.0.0.1:8080", env = "SIGRELAY_ENDPOINT")]
    pub endpoint: String,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "SIGRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "32", env = "SIGRELAY_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum inbound WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "SIGRELAY_MAX_FRAME_SIZE")]
    pub max_frame_size: usize,
    /// Outbound messages a peer may have queued before it is evicted.
    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY, env = "SIGRELAY_MAILBOX_CAPACITY")]
    pub mailbox_capacity: usize,
    /// Seconds without any inbound frame before a connection is dropped.
    #[arg(long, default_value = "60", env = "SIGRELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Deadline in seconds for writing a single frame.
    #[arg(long, default_value = "10", env = "SIGRELAY_WRITE_TIMEOUT")]
    pub write_timeout: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to accept connections on.
    pub bind: SocketAddr,
    /// Host and port advertised to browsers for the client WebSocket.
    pub endpoint: String,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_frame_size: usize,
    /// Outbound messages a peer may have queued before it is evicted.
    pub mailbox_capacity: usize,
    /// Seconds without any inbound frame before a connection is dropped.
    pub idle_timeout: u64,
    /// Deadline in seconds for writing a single frame.
    pub write_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if self
            .endpoint
            .chars()
            .any(|c| c == '/' || c.is_whitespace())
        {
            return Err("endpoint must be a bare host:port".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        const MAX_ALLOWED_FRAME: usize = 16 * 1024 * 1024;
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be greater than 0".to_string());
        }
        if self.max_frame_size > MAX_ALLOWED_FRAME {
            return Err(format!(
                "max_frame_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_FRAME
            ));
        }

        if self.mailbox_capacity == 0 {
            return Err("mailbox_capacity must be greater than 0".to_string());
        }
        if self.mailbox_capacity > 65_536 {
            return Err("mailbox_capacity exceeds reasonable limit (65,536)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.write_timeout > 300 {
            return Err("write_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }

    /// How long a connection may stay silent before it is dropped.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Deadline for a single outbound frame.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Keepalive ping period: nine tenths of the idle timeout, so a quiet
    /// but healthy remote always answers before its own deadline.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.idle_timeout() * 9 / 10
    }

    /// WebSocket URL the bootstrap page connects to.
    #[must_use]
    pub fn client_ws_url(&self) -> String {
        format!("ws://{}/ws", self.endpoint)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind: args.bind,
            endpoint: args.endpoint,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_frame_size: args.max_frame_size,
            mailbox_capacity: args.mailbox_capacity,
            idle_timeout: args.idle_timeout,
            write_timeout: args.write_timeout,
        }
    }
}
