//! JSON signaling envelope exchanged with every peer.
//!
//! An envelope is a flat object with four string fields:
//!
//! ```json
//! {"source":"…","destination":"…","method":"offer","parameter":"v=0…"}
//! ```
//!
//! `source` and `destination` are optional. Missing, `null` and empty values
//! all decode to `None`, and `None` is omitted when encoding. `method` and
//! `parameter` are opaque to the relay and default to empty strings.

use crate::types::{method, PeerId};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors that can occur while decoding or encoding an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes were not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A signaling message as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Original sender. Only ever filled in by the relay.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub source: Option<String>,
    /// Intended recipient, set by the server role when replying to a client.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub destination: Option<String>,
    /// Negotiation step, e.g. `offer`.
    #[serde(default)]
    pub method: String,
    /// Opaque payload such as an SDP blob.
    #[serde(default)]
    pub parameter: String,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl Envelope {
    /// Creates an unaddressed envelope.
    #[must_use]
    pub fn new(method: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            source: None,
            destination: None,
            method: method.into(),
            parameter: parameter.into(),
        }
    }

    /// Creates an envelope addressed to `destination`.
    #[must_use]
    pub fn to(
        destination: PeerId,
        method: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            destination: Some(destination.to_string()),
            ..Self::new(method, parameter)
        }
    }

    /// The `close` notice the relay sends to server peers when `peer` leaves.
    #[must_use]
    pub fn close_notice(peer: PeerId, reason: &str) -> Self {
        Self {
            source: Some(peer.to_string()),
            ..Self::new(method::CLOSE, reason)
        }
    }

    /// Copy of this envelope as delivered to a client: addressed to
    /// `recipient`, with any sender identity stripped.
    #[must_use]
    pub fn for_client(&self, recipient: PeerId) -> Self {
        Self {
            source: None,
            destination: Some(recipient.to_string()),
            method: self.method.clone(),
            parameter: self.parameter.clone(),
        }
    }

    /// Copy of this envelope as delivered to a server: tagged with the
    /// trusted `sender` id and no destination.
    #[must_use]
    pub fn for_server(&self, sender: PeerId) -> Self {
        Self {
            source: Some(sender.to_string()),
            destination: None,
            method: self.method.clone(),
            parameter: self.parameter.clone(),
        }
    }

    /// The destination interpreted as a peer id, if it is one.
    #[must_use]
    pub fn destination_id(&self) -> Option<PeerId> {
        self.destination.as_deref().and_then(|d| d.parse().ok())
    }

    /// Decodes an envelope from raw frame bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the bytes are not a JSON object
    /// with string-valued envelope fields.
    pub fn parse(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Malformed)
    }

    /// Encodes this envelope as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }
}
