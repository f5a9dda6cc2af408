//! Courier wire records: tags, control commands, chat and file-transfer payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Sent in the TCP hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identity the router signs its system notices with.
pub const ROUTER_IDENTITY: &str = "server";

/// Address of a participant in the process group.
pub type Rank = u32;

/// Transfer identifier, minted by the offering peer and never reused.
pub type FileId = Uuid;

/// Wire-level discriminator. Values must match across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Tag {
    Msg = 1,
    FileMeta = 2,
    FileChunk = 3,
    Cmd = 4,
    FileReq = 6,
    FileAck = 7,
    FileDeny = 8,
}

impl From<Tag> for u8 {
    fn from(tag: Tag) -> u8 {
        tag as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Tag::Msg),
            2 => Ok(Tag::FileMeta),
            3 => Ok(Tag::FileChunk),
            4 => Ok(Tag::Cmd),
            6 => Ok(Tag::FileReq),
            7 => Ok(Tag::FileAck),
            8 => Ok(Tag::FileDeny),
            other => Err(format!("unknown tag {}", other)),
        }
    }
}

/// Who a routed record is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// Every connected peer except the sender.
    All,
    Peer(String),
}

impl Recipient {
    pub fn peer(identity: impl Into<String>) -> Self {
        Recipient::Peer(identity.into())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::All)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::All => f.write_str("all"),
            Recipient::Peer(id) => f.write_str(id),
        }
    }
}

/// How a peer wants a record delivered: through the relay or straight to the target rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    Relay,
    P2p,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Relay => f.write_str("relay"),
            DeliveryMode::P2p => f.write_str("p2p"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relay" => Ok(DeliveryMode::Relay),
            "p2p" => Ok(DeliveryMode::P2p),
            other => Err(format!("unknown delivery mode '{}'", other)),
        }
    }
}

/// A connected participant as the router tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub identity: String,
    pub display_name: String,
    pub rank: Rank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub from: String,
    pub to: Recipient,
    pub content: String,
    pub kind: MessageKind,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ChatMessage {
    pub fn text(from: impl Into<String>, to: Recipient, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            from: from.into(),
            to,
            content: content.into(),
            kind: MessageKind::Text,
            timestamp: now_timestamp(),
        }
    }

    pub fn system(to: Recipient, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            from: ROUTER_IDENTITY.to_string(),
            to,
            content: content.into(),
            kind: MessageKind::System,
            timestamp: now_timestamp(),
        }
    }

    /// Local wall-clock rendering of the timestamp, `HH:MM:SS`.
    pub fn time_of_day(&self) -> String {
        let secs = self.timestamp.trunc() as i64;
        let nanos = (self.timestamp.fract() * 1e9) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos)
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string())
    }
}

/// Membership commands, plus the presence snapshot the router pushes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    Join {
        identity: String,
        display_name: String,
    },
    Leave,
    Shutdown,
    UserListUpdate {
        peers: Vec<Peer>,
    },
}

/// A proposed, not-yet-approved transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub from: String,
    pub to: String,
    pub from_rank: Rank,
}

/// ACK or DENY for an offer. `to` is the offering identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReply {
    pub file_id: FileId,
    pub to: String,
}

/// Sent once before the chunks of an approved transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub from: String,
    pub to: String,
    pub chunk_size: u64,
    /// SHA-256 of the whole file.
    pub digest: [u8; 32],
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file_id: FileId,
    pub filename: String,
    pub index: u64,
    pub total: u64,
    pub payload: Vec<u8>,
    pub to: String,
}

impl Chunk {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("file_id", &self.file_id)
            .field("filename", &self.filename)
            .field("index", &self.index)
            .field("total", &self.total)
            .field("len", &self.payload.len())
            .field("to", &self.to)
            .finish()
    }
}

/// Every record that travels over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Control(Control),
    Chat(ChatMessage),
    FileMeta(FileMeta),
    FileChunk(Chunk),
    FileReq(TransferOffer),
    FileAck(TransferReply),
    FileDeny(TransferReply),
}

impl Payload {
    /// The tag this payload is sent under.
    pub fn tag(&self) -> Tag {
        match self {
            Payload::Control(_) => Tag::Cmd,
            Payload::Chat(_) => Tag::Msg,
            Payload::FileMeta(_) => Tag::FileMeta,
            Payload::FileChunk(_) => Tag::FileChunk,
            Payload::FileReq(_) => Tag::FileReq,
            Payload::FileAck(_) => Tag::FileAck,
            Payload::FileDeny(_) => Tag::FileDeny,
        }
    }

    /// Routing key read by the relay. `None` for control records, which the relay consumes.
    pub fn recipient(&self) -> Option<Recipient> {
        match self {
            Payload::Control(_) => None,
            Payload::Chat(m) => Some(m.to.clone()),
            Payload::FileMeta(m) => Some(Recipient::peer(&m.to)),
            Payload::FileChunk(c) => Some(Recipient::peer(&c.to)),
            Payload::FileReq(o) => Some(Recipient::peer(&o.to)),
            Payload::FileAck(r) | Payload::FileDeny(r) => Some(Recipient::peer(&r.to)),
        }
    }
}

/// A received record together with who sent it and under which tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Payload,
    pub source: Rank,
    pub tag: Tag,
}

impl Envelope {
    pub fn new(payload: Payload, source: Rank) -> Self {
        let tag = payload.tag();
        Self {
            payload,
            source,
            tag,
        }
    }
}

/// Seconds since the Unix epoch, with microsecond precision.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Identity for a peer at `rank`: `user_<rank>_<4 hex chars>`.
pub fn mint_identity(rank: Rank) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("user_{}_{}", rank, &suffix[..4])
}
