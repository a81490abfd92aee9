//! Error kinds surfaced by the connection lifecycle core.

use protocol::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// The handshake credential was rejected; no connection was created.
    #[error("authorization rejected")]
    Unauthorized,

    /// The upgrade request was not a well-formed WebSocket handshake.
    #[error("bad handshake request: {0}")]
    BadRequest(&'static str),

    /// Admission refused because shutdown has begun.
    #[error("server is shutting down")]
    ServerShuttingDown,

    /// The join event could not be handed to the simulation in time.
    #[error("simulation did not accept the new client in time")]
    SimulationUnavailable,

    /// One frame could not be decoded. Not fatal to the connection.
    #[error(transparent)]
    MalformedFrame(#[from] DecodeError),

    /// The outbound queue is full; the caller decides whether to retry or drop.
    #[error("outbound queue is full")]
    Congested,

    /// The connection is closing or closed and accepts no more sends.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A physical read or write failed. Fatal to that connection only.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] std::io::Error),

    #[error("network service already started")]
    AlreadyStarted,

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// HTTP status the handshake boundary answers with when admission is
    /// refused before the upgrade completes.
    pub fn rejection_status(&self) -> u16 {
        match self {
            NetworkError::BadRequest(_) => 400,
            NetworkError::Unauthorized => 401,
            NetworkError::ServerShuttingDown | NetworkError::SimulationUnavailable => 503,
            _ => 500,
        }
    }
}
