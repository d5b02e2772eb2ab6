//! Per-connection transport loops.
//!
//! A [`Peer`] owns the consuming end of its mailbox. Its read loop feeds
//! inbound frames to the router; its write loop drains the mailbox into the
//! socket and keeps the connection alive with pings. Whichever loop ends
//! first tears the connection down.

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::router::{InboundEvent, PeerHandle, RouterHandle};
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sigrelay_common::{PeerId, Role};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Connection timing derived from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// Silence allowed on the read side before the connection is dropped.
    pub idle_timeout: Duration,
    /// Period between outbound pings.
    pub ping_interval: Duration,
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for Keepalive {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            ping_interval: config.ping_interval(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// A live connection that has not started its loops yet.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    role: Role,
    outbox: mpsc::Receiver<String>,
}

impl Peer {
    /// Create a peer with a fresh id and a mailbox of `capacity` entries.
    ///
    /// The returned [`PeerHandle`] holds the only mailbox sender and must be
    /// passed to the router.
    #[must_use]
    pub fn new(role: Role, capacity: usize) -> (Self, PeerHandle) {
        let id = PeerId::random();
        let (mailbox, outbox) = mpsc::channel(capacity);
        (Self { id, role, outbox }, PeerHandle { id, role, mailbox })
    }

    /// This peer's identity.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// This peer's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Drive the read and write loops until either ends, then deregister.
    ///
    /// The socket is dropped, and with it the connection closed, before this
    /// returns.
    pub async fn run<T>(self, socket: T, router: &RouterHandle, keepalive: Keepalive)
    where
        T: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Unpin,
        <T as Sink<Message>>::Error: Display,
    {
        let Self { id, role, outbox } = self;
        let (sink, stream) = socket.split();

        let result = tokio::select! {
            r = read_loop(stream, id, role, router, keepalive.idle_timeout) => r,
            r = write_loop(sink, outbox, keepalive.ping_interval, keepalive.write_timeout) => r,
        };

        match result {
            Ok(()) => info!(peer = %id, role = %role, "peer disconnected"),
            Err(e) => info!(peer = %id, role = %role, error = %e, "peer connection ended"),
        }

        if router.deregister(id).await.is_err() {
            debug!(peer = %id, "router stopped before deregistration");
        }
    }
}

/// Forward every data frame to the router until the stream ends, errors, or
/// stays silent for `idle_timeout`.
///
/// Ping and pong frames only refresh the idle deadline.
///
/// # Errors
///
/// Returns the transport error, [`RelayError::IdleTimeout`], or
/// [`RelayError::RouterUnavailable`]. A close frame or end of stream is `Ok`.
pub async fn read_loop<S>(
    mut stream: S,
    id: PeerId,
    role: Role,
    router: &RouterHandle,
    idle_timeout: Duration,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let msg = timeout(idle_timeout, stream.next())
            .await
            .map_err(|_| RelayError::IdleTimeout)?;

        let data = match msg {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
        };

        router
            .dispatch(InboundEvent {
                sender: id,
                sender_role: role,
                data,
            })
            .await?;
    }
}

/// Drain the mailbox into `sink`, pinging every `ping_interval`.
///
/// When the mailbox closes, a close frame is sent and the loop ends.
///
/// # Errors
///
/// Returns [`RelayError::Transport`] or [`RelayError::WriteTimeout`] when a
/// message or ping cannot be written.
pub async fn write_loop<K>(
    mut sink: K,
    mut outbox: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_timeout: Duration,
) -> Result<(), RelayError>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = outbox.recv() => match msg {
                Some(text) => send_before(&mut sink, Message::Text(text), write_timeout).await?,
                None => {
                    let close = send_before(&mut sink, Message::Close(None), write_timeout).await;
                    if let Err(e) = close {
                        debug!(error = %e, "failed to send close frame");
                    }
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                send_before(&mut sink, Message::Ping(Vec::new()), write_timeout).await?;
            }
        }
    }
}

async fn send_before<K>(sink: &mut K, msg: Message, deadline: Duration) -> Result<(), RelayError>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Transport(e.to_string())),
        Err(_) => Err(RelayError::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Router, RouterEvent};
    use futures::channel::mpsc as fmpsc;
    use futures::stream;
    use sigrelay_common::Envelope;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    const SECOND: Duration = Duration::from_secs(1);

    /// In-memory socket: frames pushed into `inbound` are read, written
    /// frames land in `outbound`.
    struct Duplex {
        inbound: fmpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        outbound: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for Duplex {
        type Item = Result<Message, axum::Error>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.get_mut().inbound).poll_next(cx)
        }
    }

    impl Sink<Message> for Duplex {
        type Error = fmpsc::SendError;

        fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.get_mut().outbound).poll_ready(cx)
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            Pin::new(&mut self.get_mut().outbound).start_send(item)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.get_mut().outbound).poll_flush(cx)
        }

        fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.get_mut().outbound).poll_close(cx)
        }
    }

    #[test]
    fn keepalive_follows_config() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            endpoint: "localhost:0".to_string(),
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            max_conns: 10,
            max_conns_ip: 10,
            max_frame_size: 1024,
            mailbox_capacity: 8,
            idle_timeout: 60,
            write_timeout: 10,
        };
        let keepalive = Keepalive::from(&config);
        assert_eq!(keepalive.idle_timeout, Duration::from_secs(60));
        assert_eq!(keepalive.ping_interval, Duration::from_secs(54));
        assert_eq!(keepalive.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn new_peer_shares_identity_with_handle() {
        let (peer, handle) = Peer::new(Role::Server, 4);
        assert_eq!(peer.id(), handle.id);
        assert_eq!(peer.role(), Role::Server);
        assert_eq!(handle.role, Role::Server);
        assert_eq!(handle.mailbox.max_capacity(), 4);
    }

    #[tokio::test]
    async fn read_loop_dispatches_frames_in_order() {
        let (tx, mut intake) = mpsc::channel(16);
        let router = RouterHandle::from_sender(tx);
        let id = PeerId::random();
        let frames = stream::iter(vec![
            Ok(Message::Text(r#"{"method":"start"}"#.to_string())),
            Ok(Message::Ping(vec![1])),
            Ok(Message::Binary(br#"{"method":"answer"}"#.to_vec())),
            Ok(Message::Close(None)),
            Ok(Message::Text("never read".to_string())),
        ]);

        read_loop(frames, id, Role::Client, &router, SECOND)
            .await
            .unwrap();

        let mut methods = Vec::new();
        while let Ok(RouterEvent::Dispatch(event)) = intake.try_recv() {
            assert_eq!(event.sender, id);
            assert_eq!(event.sender_role, Role::Client);
            methods.push(Envelope::parse(&event.data).unwrap().method);
        }
        assert_eq!(methods, ["start", "answer"]);
    }

    #[tokio::test]
    async fn read_loop_ends_cleanly_at_end_of_stream() {
        let (router, _task) = Router::spawn(16);
        let frames = stream::iter(Vec::<Result<Message, axum::Error>>::new());
        let result = read_loop(frames, PeerId::random(), Role::Server, &router, SECOND).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn read_loop_reports_transport_error() {
        let (router, _task) = Router::spawn(16);
        let frames = stream::iter(vec![Err(axum::Error::new(std::io::Error::other("reset")))]);
        let result = read_loop(frames, PeerId::random(), Role::Client, &router, SECOND).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn read_loop_times_out_when_idle() {
        let (router, _task) = Router::spawn(16);
        let frames = stream::iter(vec![Ok(Message::Pong(Vec::new()))]).chain(stream::pending());

        let started = Instant::now();
        let result =
            read_loop(frames, PeerId::random(), Role::Client, &router, Duration::from_secs(60))
                .await;

        assert!(matches!(result, Err(RelayError::IdleTimeout)));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn read_loop_fails_when_router_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let router = RouterHandle::from_sender(tx);
        let frames = stream::iter(vec![Ok(Message::Text("{}".to_string()))]);

        let result = read_loop(frames, PeerId::random(), Role::Client, &router, SECOND).await;
        assert!(matches!(result, Err(RelayError::RouterUnavailable)));
    }

    #[tokio::test]
    async fn write_loop_drains_mailbox_then_sends_close() {
        let (sink, mut sent) = fmpsc::unbounded::<Message>();
        let (mailbox, outbox) = mpsc::channel(8);
        mailbox.send("one".to_string()).await.unwrap();
        mailbox.send("two".to_string()).await.unwrap();
        drop(mailbox);

        write_loop(sink, outbox, Duration::from_secs(54), SECOND)
            .await
            .unwrap();

        let frames: Vec<Message> = std::iter::from_fn(|| sent.try_next().ok().flatten()).collect();
        assert_eq!(
            frames,
            vec![
                Message::Text("one".to_string()),
                Message::Text("two".to_string()),
                Message::Close(None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_pings_on_interval() {
        let (sink, mut sent) = fmpsc::unbounded::<Message>();
        let (mailbox, outbox) = mpsc::channel::<String>(8);
        let writer = tokio::spawn(write_loop(
            sink,
            outbox,
            Duration::from_secs(54),
            Duration::from_secs(10),
        ));

        tokio::time::sleep(Duration::from_secs(53)).await;
        assert!(sent.try_next().is_err(), "no ping before the first period");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent.try_next().unwrap(), Some(Message::Ping(Vec::new())));

        tokio::time::sleep(Duration::from_secs(54)).await;
        assert_eq!(sent.try_next().unwrap(), Some(Message::Ping(Vec::new())));

        drop(mailbox);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_gives_up_after_write_deadline() {
        let (mailbox, outbox) = mpsc::channel(8);
        mailbox.send("stuck".to_string()).await.unwrap();
        // Never read, so the write can not complete.
        let (sink, _unread) = fmpsc::channel::<Message>(0);

        let result = write_loop(sink, outbox, Duration::from_secs(54), SECOND).await;
        assert!(matches!(result, Err(RelayError::WriteTimeout)));
        drop(mailbox);
    }

    #[tokio::test]
    async fn write_loop_reports_closed_transport() {
        let (sink, sent) = fmpsc::unbounded::<Message>();
        drop(sent);
        let (mailbox, outbox) = mpsc::channel(8);
        mailbox.send("lost".to_string()).await.unwrap();

        let result = write_loop(sink, outbox, Duration::from_secs(54), SECOND).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn run_tears_down_when_mailbox_closes() {
        let (peer, handle) = Peer::new(Role::Client, 1);
        let id = peer.id();
        handle.mailbox.try_send("x".to_string()).unwrap();
        // The router dropping its entry is what closes the mailbox on eviction.
        drop(handle);

        let (inbound_tx, inbound) = fmpsc::unbounded();
        let (outbound, mut sent) = fmpsc::unbounded();
        let (tx, mut intake) = mpsc::channel(4);
        let router = RouterHandle::from_sender(tx);
        let keepalive = Keepalive {
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: SECOND,
        };

        tokio::time::timeout(
            2 * SECOND,
            peer.run(Duplex { inbound, outbound }, &router, keepalive),
        )
        .await
        .expect("run kept waiting on an open inbound stream");

        let frames: Vec<Message> = std::iter::from_fn(|| sent.try_next().ok().flatten()).collect();
        assert_eq!(frames, vec![Message::Text("x".to_string()), Message::Close(None)]);
        assert!(matches!(intake.try_recv(), Ok(RouterEvent::Deregister(gone)) if gone == id));
        assert!(intake.try_recv().is_err());
        drop(inbound_tx);
    }
}
