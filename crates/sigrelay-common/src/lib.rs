//! Wire types shared by the sigrelay signaling relay and its peers.
//!
//! This crate provides:
//! - The JSON signaling message ([`envelope`])
//! - Peer identity, roles and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeError};
pub use types::{PeerId, Role};
