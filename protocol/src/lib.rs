//! Wire protocol shared by the game server and its clients.
//!
//! Every WebSocket binary message carries exactly one [`Envelope`]: a
//! [`MessageKind`] tag followed by an opaque payload. The server front end
//! never looks inside the payload; the kind tells the simulation how to
//! interpret it.
//!
//! ## Frame layout
//!
//! All integers are little endian:
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0      | 4    | kind discriminant (`u32`)  |
//! | 4      | 8    | payload length (`u64`)     |
//! | 12     | n    | payload bytes              |
//!
//! This is exactly bincode's fixed-int encoding of [`Envelope`], so clients
//! written against `bincode::serialize` interoperate with [`encode`].

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed frame header (kind + payload length).
pub const HEADER_LEN: usize = 12;

/// Largest payload accepted by [`decode`].
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Application-level message kinds.
///
/// The discriminant order is part of the wire format; append new kinds at
/// the end.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Ping,
    Pong,
    Input,
    Chat,
    Action,
    WorldUpdate,
    Disconnect,
}

/// A single typed unit of application data.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Envelope with no payload, e.g. a bare `Ping` or `Disconnect`.
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Number of bytes [`encode`] produces for this envelope.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Reasons a frame could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] bincode::Error),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit((HEADER_LEN + MAX_PAYLOAD_LEN) as u64)
}

/// Serializes an envelope into a single wire frame.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut frame = Vec::with_capacity(envelope.encoded_len());
    frame.extend_from_slice(&(envelope.kind as u32).to_le_bytes());
    frame.extend_from_slice(&(envelope.payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(&envelope.payload);
    frame
}

/// Parses one wire frame.
///
/// Truncated frames, unknown kind discriminants, oversized payloads and
/// trailing bytes are all reported as [`DecodeError::MalformedFrame`].
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    Ok(wire_options().deserialize(frame)?)
}
