//! Wire envelope carried across the local bus.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message id marking a publish that was never persisted.
///
/// Ephemeral envelopes are delivered locally after commit but have no
/// backing row, so there is no pending bit to clear and no retry.
pub const EPHEMERAL_ID: u64 = 0;

/// What the local bus actually transports: the persisted id (or
/// [`EPHEMERAL_ID`]), the bitmask of component indices that still owe
/// consumption, and the serialized payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Generated message id, or [`EPHEMERAL_ID`] when nothing was persisted.
    pub id: u64,
    /// Bitmask of subscriber indices that have not yet consumed this message.
    pub pending_mask: u32,
    /// JSON-serialized payload.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(id: u64, pending_mask: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            pending_mask,
            payload,
        }
    }

    /// Whether this envelope has a persisted row behind it.
    pub fn is_durable(&self) -> bool {
        self.id != EPHEMERAL_ID
    }

    /// Whether the component at `index` still owes consumption.
    pub fn is_pending_for(&self, index: u8) -> bool {
        self.pending_mask & (1u32 << index) != 0
    }
}

/// Error type for payload encoding/decoding.
#[derive(Debug)]
pub enum CodecError {
    /// Serializing a payload to its wire form failed.
    EncodeFailed(String),
    /// Deserializing a wire payload into the expected type failed.
    DecodeFailed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::EncodeFailed(msg) => write!(f, "payload encode failed: {}", msg),
            CodecError::DecodeFailed(msg) => write!(f, "payload decode failed: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Serialize a payload to the wire form used for persistence and local
/// delivery (JSON).
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(payload).map_err(|e| CodecError::EncodeFailed(e.to_string()))
}

/// Deserialize a wire payload back into its concrete type.
pub fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::DecodeFailed(e.to_string()))
}
