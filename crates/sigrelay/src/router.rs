//! Single-owner registry of connected peers and the routing rules between roles.
//!
//! The [`Router`] runs as one task. Everything else talks to it through a
//! [`RouterHandle`], whose events are applied strictly one at a time, so the
//! registry needs no locking.

use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use sigrelay_common::types::close_reason;
use sigrelay_common::{Envelope, PeerId, Role};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default depth of the router intake queue.
pub const DEFAULT_INTAKE_CAPACITY: usize = 1024;

/// Registration request for a freshly accepted connection.
///
/// The mailbox sender is handed over to the router, which becomes its only
/// owner. Dropping it is what closes the mailbox.
#[derive(Debug)]
pub struct PeerHandle {
    /// Identity assigned by the acceptor.
    pub id: PeerId,
    /// Endpoint the connection came in on.
    pub role: Role,
    /// Producer side of the peer's outbound queue.
    pub mailbox: mpsc::Sender<String>,
}

/// A frame read from a peer, tagged with the sender's trusted identity.
#[derive(Debug)]
pub struct InboundEvent {
    /// Registry id of the connection the frame arrived on.
    pub sender: PeerId,
    /// Role of that connection.
    pub sender_role: Role,
    /// Raw frame payload, expected to hold an [`Envelope`].
    pub data: Vec<u8>,
}

/// Everything the router reacts to.
#[derive(Debug)]
pub enum RouterEvent {
    /// Add a peer to the registry.
    Register(PeerHandle),
    /// Remove a peer whose connection ended.
    Deregister(PeerId),
    /// Route an inbound frame.
    Dispatch(InboundEvent),
}

/// Cloneable intake for a running [`Router`].
#[derive(Clone, Debug)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterEvent>,
}

impl RouterHandle {
    /// Queue a peer for registration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RouterUnavailable`] if the router task has stopped.
    pub async fn register(&self, peer: PeerHandle) -> Result<(), RelayError> {
        self.send(RouterEvent::Register(peer)).await
    }

    /// Queue removal of `id`. Removing an absent id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RouterUnavailable`] if the router task has stopped.
    pub async fn deregister(&self, id: PeerId) -> Result<(), RelayError> {
        self.send(RouterEvent::Deregister(id)).await
    }

    /// Hand an inbound frame to the router, waiting while its intake is full.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RouterUnavailable`] if the router task has stopped.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<(), RelayError> {
        self.send(RouterEvent::Dispatch(event)).await
    }

    /// Returns `true` once the router task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<RouterEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: RouterEvent) -> Result<(), RelayError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::RouterUnavailable)
    }
}

#[derive(Debug)]
struct Entry {
    role: Role,
    mailbox: mpsc::Sender<String>,
}

/// Why an enqueue into a mailbox failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undeliverable {
    /// The mailbox is at capacity; the consumer is too slow.
    Full,
    /// The write loop has already gone away.
    Gone,
}

impl Undeliverable {
    const fn close_reason(self) -> &'static str {
        match self {
            Self::Full => close_reason::EVICTED,
            Self::Gone => close_reason::REMOTE_DISCONNECTED,
        }
    }
}

impl Entry {
    fn try_deliver(&self, data: String) -> Result<(), Undeliverable> {
        match self.mailbox.try_send(data) {
            Ok(()) => {
                counters::envelopes_relayed_total();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters::envelopes_dropped_total("mailbox_full");
                Err(Undeliverable::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counters::envelopes_dropped_total("offline");
                Err(Undeliverable::Gone)
            }
        }
    }
}

/// The peer registry. Owned by exactly one task.
#[derive(Debug, Default)]
pub struct Router {
    peers: HashMap<PeerId, Entry>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a router task with an intake queue of `intake_capacity` events.
    ///
    /// The task ends when every [`RouterHandle`] has been dropped.
    #[must_use]
    pub fn spawn(intake_capacity: usize) -> (RouterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(intake_capacity);
        let task = tokio::spawn(Self::new().run(rx));
        (RouterHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RouterEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        debug!(peers = self.peers.len(), "router intake closed");
    }

    /// Apply a single event.
    pub fn handle(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Register(peer) => self.register(peer),
            RouterEvent::Deregister(id) => self.deregister(id),
            RouterEvent::Dispatch(inbound) => {
                let start = Instant::now();
                self.dispatch(&inbound);
                histograms::dispatch_latency_seconds(start.elapsed().as_secs_f64());
            }
        }
    }

    /// Insert a peer.
    ///
    /// # Panics
    ///
    /// Panics if the id is already registered. Ids are random 128-bit values,
    /// so a collision means the registry can no longer be trusted.
    pub fn register(&mut self, peer: PeerHandle) {
        if self.peers.contains_key(&peer.id) {
            error!(peer = %peer.id, "peer id collision");
            panic!("peer id collision: {}", peer.id);
        }
        info!(peer = %peer.id, role = %peer.role, "peer registered");
        gauges::inc_peers_active(peer.role);
        self.peers.insert(
            peer.id,
            Entry {
                role: peer.role,
                mailbox: peer.mailbox,
            },
        );
    }

    /// Remove a peer whose connection ended. A no-op if it is already gone.
    pub fn deregister(&mut self, id: PeerId) {
        self.remove(id, close_reason::REMOTE_DISCONNECTED);
    }

    /// Route one inbound frame according to the sender's role.
    pub fn dispatch(&mut self, event: &InboundEvent) {
        if !self.peers.contains_key(&event.sender) {
            debug!(peer = %event.sender, "dropping frame from unregistered peer");
            counters::envelopes_dropped_total("unregistered");
            return;
        }

        let envelope = match Envelope::parse(&event.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %event.sender, error = %e, "discarding malformed envelope");
                counters::envelopes_dropped_total("malformed");
                return;
            }
        };

        let failed = match event.sender_role {
            Role::Server => self.forward_to_client(event.sender, &envelope),
            Role::Client => self.forward_to_servers(event.sender, &envelope),
        };

        for (id, why) in failed {
            if why == Undeliverable::Full {
                warn!(peer = %id, "mailbox full, evicting peer");
                counters::peers_evicted_total();
            }
            self.remove(id, why.close_reason());
        }
    }

    /// Server → client: deliver only to the addressed peer, without `source`.
    fn forward_to_client(
        &self,
        sender: PeerId,
        envelope: &Envelope,
    ) -> Vec<(PeerId, Undeliverable)> {
        let recipient = envelope.destination_id().filter(|dest| *dest != sender);
        let Some((dest, entry)) = recipient.and_then(|dest| self.peers.get_key_value(&dest))
        else {
            debug!(
                peer = %sender,
                destination = ?envelope.destination,
                method = %envelope.method,
                "no registered recipient"
            );
            counters::envelopes_dropped_total("unknown_destination");
            return Vec::new();
        };

        let Some(data) = encode(&envelope.for_client(*dest)) else {
            return Vec::new();
        };
        match entry.try_deliver(data) {
            Ok(()) => Vec::new(),
            Err(why) => vec![(*dest, why)],
        }
    }

    /// Client → every server-role peer, tagged with the client's id.
    fn forward_to_servers(
        &self,
        sender: PeerId,
        envelope: &Envelope,
    ) -> Vec<(PeerId, Undeliverable)> {
        let Some(data) = encode(&envelope.for_server(sender)) else {
            return Vec::new();
        };
        self.peers
            .iter()
            .filter(|(id, entry)| **id != sender && entry.role.is_server())
            .filter_map(|(id, entry)| entry.try_deliver(data.clone()).err().map(|why| (*id, why)))
            .collect()
    }

    /// Remove `first` and tell every server peer it is gone. Servers whose
    /// mailboxes cannot take the notice are removed in turn.
    fn remove(&mut self, first: PeerId, reason: &'static str) {
        let mut pending = VecDeque::from([(first, reason)]);

        while let Some((id, reason)) = pending.pop_front() {
            // Dropping the entry drops the only mailbox sender, which closes it.
            let Some(entry) = self.peers.remove(&id) else {
                continue;
            };
            gauges::dec_peers_active(entry.role);
            info!(peer = %id, role = %entry.role, reason, "peer removed");
            drop(entry);

            let Some(notice) = encode(&Envelope::close_notice(id, reason)) else {
                continue;
            };
            for (server, entry) in self.peers.iter().filter(|(_, e)| e.role.is_server()) {
                if let Err(why) = entry.try_deliver(notice.clone()) {
                    if why == Undeliverable::Full {
                        warn!(peer = %server, "mailbox full, evicting peer");
                        counters::peers_evicted_total();
                    }
                    pending.push_back((*server, why.close_reason()));
                }
            }
        }
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` if no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns `true` if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match envelope.to_json() {
        Ok(data) => Some(data),
        Err(e) => {
            error!(error = %e, "failed to encode envelope");
            None
        }
    }
}
