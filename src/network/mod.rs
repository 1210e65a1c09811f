//! P2P Networking module
//!
//! Relays transactions and blocks between nodes.
//!
//! # Features
//! - TCP connections with magic + length framed JSON messages
//! - Inventory based transaction relay
//! - Full and compact block relay with `getblocktxn` reconstruction
//! - Reject messages and per-peer misbehavior scores
//! - Batch catch-up with `GetBlocks`

pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod sync;

pub use message::{
    Handshake, InvItem, InvType, Message, RejectMessage, MAGIC, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
pub use node::{Node, NodeError, NodeEvent, NodeStatus};
pub use peer::{PeerError, PeerHandle, PeerInfo, PeerManager, PeerState, DISCONNECT_SCORE, MAX_PEERS};
pub use server::{connect_to_peer, MessageCodec, Server};
pub use sync::{wait_until, ChainSync};
