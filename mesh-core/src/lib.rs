//! meshchat overlay protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod gossip;
pub mod hub;
pub mod mesh;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod seen;
pub mod store;
pub mod transfer;
pub mod wire;

pub use config::MeshConfig;
pub use core::{Action, Inbound, MeshCore, Timer};
pub use gossip::{Interceptor, Verdict};
pub use mesh::{ConnState, PeerSummary};
pub use presence::{Endpoint, PresenceAction, PresenceState, CLEAN_DISCONNECT, PRESENCE_TOPIC};
pub use protocol::{
    ChatMessage, Contact, FileMeta, MessageBody, Packet, PeerId, Target, PROTOCOL_VERSION,
};
pub use store::{MemoryObjects, MemoryStore, MessageStore, ObjectStore, PendingEnvelope, PendingStore, Store};
pub use transfer::{StreamEvent, TransferError};
pub use wire::{decode_payload, encode_payload, FrameDecodeError, FrameEncodeError, Payload};
