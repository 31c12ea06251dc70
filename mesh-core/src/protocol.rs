//! meshchat wire protocol: packet types, message envelope and version.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Prefix shared by the well-known rendezvous identities; the slot index is appended.
pub const HUB_PREFIX: &str = "meshchat-hub-";

/// Number of reserved rendezvous slots.
pub const HUB_SLOTS: u8 = 5;

/// Hop budget given to freshly sent messages.
pub const DEFAULT_TTL: u32 = 20;

/// Flat string identity of a node on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random identity (UUID v4).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    /// Rendezvous identity for `slot`.
    pub fn hub(slot: u8) -> Self {
        PeerId(format!("{HUB_PREFIX}{slot}"))
    }

    /// Slot index if this is one of the reserved rendezvous identities.
    pub fn hub_slot(&self) -> Option<u8> {
        let slot: u8 = self.0.strip_prefix(HUB_PREFIX)?.parse().ok()?;
        (slot < HUB_SLOTS).then_some(slot)
    }

    pub fn is_hub(&self) -> bool {
        self.hub_slot().is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

/// Addressee of a message: everybody, or one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Broadcast,
    Peer(PeerId),
}

/// Metadata of a shared file object. Broadcast once per shared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

/// Message kind and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    FileShare(FileMeta),
}

/// MSG envelope. `id` is immutable and globally unique per logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: PeerId,
    pub sender_name: Option<String>,
    pub target: Target,
    /// Logical time. Receivers substitute `clock + 1` when absent.
    pub timestamp: Option<u64>,
    pub ttl: u32,
    pub body: MessageBody,
}

impl ChatMessage {
    pub fn is_broadcast(&self) -> bool {
        self.target == Target::Broadcast
    }

    /// Logical timestamp, zero when the sender left it out.
    pub fn logical_time(&self) -> u64 {
        self.timestamp.unwrap_or(0)
    }
}

/// Directory entry kept for every sender we have heard from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub peer_id: PeerId,
    pub display_name: String,
    /// Logical time of the last packet carrying this contact's name.
    pub last_seen_at: u64,
}

/// All structured packet kinds exchanged over peer connections and the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Liveness check; answered with `Pong`.
    Ping,
    Pong,
    /// First packet after a connection opens: stable identity, display name and
    /// the transport identity the connection was made under.
    Hello {
        peer_id: PeerId,
        name: String,
        network_id: PeerId,
    },
    /// Peer exchange: a bounded sample of known transport identities, sender included.
    PeerEx { peers: Vec<PeerId> },
    /// Ask for broadcast history after the given logical time.
    AskPub { since: u64 },
    /// Reply to `AskPub`, ascending by logical time.
    RepPub { messages: Vec<ChatMessage> },
    Msg(ChatMessage),
    /// Presence heartbeat. `slot` is set when the sender holds a rendezvous identity.
    HubPulse {
        peer_id: PeerId,
        origin: PeerId,
        slot: Option<u8>,
        clock: u64,
    },
    /// Who holds this file?
    WhoHas { file_id: String },
    /// Holder announcement, answers `WhoHas`.
    Have { file_id: String, meta: FileMeta },
    /// Chunk request; answered with a binary chunk frame.
    Get {
        request_id: u64,
        file_id: String,
        offset: u64,
        size: u64,
    },
}

impl Packet {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Ping => "PING",
            Packet::Pong => "PONG",
            Packet::Hello { .. } => "HELLO",
            Packet::PeerEx { .. } => "PEER_EX",
            Packet::AskPub { .. } => "ASK_PUB",
            Packet::RepPub { .. } => "REP_PUB",
            Packet::Msg(_) => "MSG",
            Packet::HubPulse { .. } => "HUB_PULSE",
            Packet::WhoHas { .. } => "WHO_HAS",
            Packet::Have { .. } => "HAVE",
            Packet::Get { .. } => "GET",
        }
    }
}
