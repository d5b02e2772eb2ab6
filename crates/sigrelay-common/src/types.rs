//! Core type definitions and protocol constants for sigrelay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default number of outbound messages a peer may have queued.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Method names observed on the wire. The relay passes them through untouched.
pub mod method {
    /// Client asks the server role to begin negotiation.
    pub const START: &str = "start";
    /// SDP offer.
    pub const OFFER: &str = "offer";
    /// SDP answer.
    pub const ANSWER: &str = "answer";
    /// Serialized ICE candidate list.
    pub const CANDIDATE: &str = "candidate";
    /// Client data channel is open.
    pub const ACQUIRE: &str = "acquire";
    /// A peer left the relay. Synthesized by the relay itself.
    pub const CLOSE: &str = "close";
}

/// Parameters the relay puts in the `close` envelopes it synthesizes.
pub mod close_reason {
    /// The peer's transport ended.
    pub const REMOTE_DISCONNECTED: &str = "remote disconnected";
    /// The peer could not keep up with its mailbox and was dropped.
    pub const EVICTED: &str = "evicted";
}

/// Random 128-bit identity assigned to each connection by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Draw a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s).map(Self)
    }
}

/// Which endpoint a peer connected through.
///
/// Only two roles exist: one privileged `Server` that answers negotiation
/// and any number of `Client`s that request it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The privileged media source.
    Server,
    /// An ordinary browser peer.
    Client,
}

impl Role {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }

    /// Returns `true` for the privileged role.
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
