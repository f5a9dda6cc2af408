//! Error taxonomy shared by the router, the agent and the transfer engine.

use crate::protocol::Rank;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Local file missing, or a rank/identity that is not online.
    #[error("not found: {0}")]
    NotFound(String),
    /// The relay could not resolve a destination.
    #[error("routing error: {0}")]
    Routing(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A record that does not fit the current protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no pending offer from rank {0}")]
    NoPendingOffer(Rank),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The reassembled file does not match the digest announced in its metadata.
    #[error("checksum mismatch for {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;
