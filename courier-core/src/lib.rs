//! Courier: rank-addressed chat and file transfer.
//! The router is host-driven (envelope in, actions out); peers run an agent over any `Transport`.

pub mod agent;
pub mod chunk;
pub mod error;
pub mod handshake;
pub mod integrity;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use agent::{AgentConfig, Event, PeerAgent, ShutdownPolicy};
pub use error::{CourierError, Result};
pub use handshake::TransferStatus;
pub use protocol::{
    ChatMessage, Control, DeliveryMode, Envelope, FileId, Payload, Peer, Rank, Recipient, Tag,
    PROTOCOL_VERSION, ROUTER_IDENTITY,
};
pub use router::{Router, RouterAction};
pub use transfer::{CompletedDownload, UploadReport};
pub use transport::{LocalGroup, LocalTransport, Mailbox, Transport, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
