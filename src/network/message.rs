//! Network message types for block and transaction relay
//!
//! Messages are JSON inside a length-prefixed frame. Transactions, blocks
//! and headers inside them serialize as the hex of their binary encoding.

use crate::core::compression::{BlockTxnRequest, BlockTxnResponse, CompactBlock};
use crate::core::validation::{RejectCode, Rejection};
use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing (regtest message start)
pub const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Largest frame payload accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Kind of object an inventory entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Tx,
    Block,
    /// Ask for a block in compact form
    CompactBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }
}

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Initial handshake when connecting
    Handshake(Handshake),

    /// Announce objects by hash
    Inv(Vec<InvItem>),

    /// Request announced objects
    GetData(Vec<InvItem>),

    /// Requested objects we do not have
    NotFound(Vec<InvItem>),

    Tx(Transaction),

    Block(Block),

    /// Ask the peer to announce new blocks as compact blocks
    SendCmpct { enable: bool },

    CmpctBlock(CompactBlock),

    /// Request the transactions of a compact block we could not match
    GetBlockTxn(BlockTxnRequest),

    BlockTxn(BlockTxnResponse),

    /// A transaction or block we sent was refused
    Reject(RejectMessage),

    /// Request blocks starting from a height
    GetBlocks { start_height: u32, count: u32 },

    /// Response with requested blocks
    Blocks(Vec<Block>),

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),
}

/// Handshake message for initial connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    /// Peers on a different network are dropped
    pub network: String,
    pub height: u32,
    pub best_hash: Hash256,
    /// Node's listening port (for incoming connections)
    pub listen_port: u16,
    pub user_agent: String,
}

impl Handshake {
    pub fn new(network: &str, height: u32, best_hash: Hash256, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            network: network.to_string(),
            height,
            best_hash,
            listen_port,
            user_agent: format!("admission-node/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// `reject`: names the refused object and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Command of the refused message (`tx` or `block`)
    pub message: String,
    /// Numeric reject code, 0 when the rejection carries none
    pub code: u16,
    pub reason: String,
    /// Hash of the refused object
    pub data: Hash256,
}

impl RejectMessage {
    pub fn tx(rejection: &Rejection, txid: Hash256) -> Self {
        Self::new("tx", rejection, txid)
    }

    pub fn block(rejection: &Rejection, hash: Hash256) -> Self {
        Self::new("block", rejection, hash)
    }

    fn new(message: &str, rejection: &Rejection, data: Hash256) -> Self {
        Self {
            message: message.to_string(),
            code: rejection.code.map(RejectCode::code).unwrap_or(0),
            reason: rejection.reason.clone(),
            data,
        }
    }

    pub fn to_rejection(&self) -> Rejection {
        match RejectCode::from_code(self.code) {
            Some(code) => Rejection::new(code, self.reason.clone()),
            None => Rejection::uncoded(self.reason.clone()),
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::SendCmpct { .. } => "sendcmpct",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn(_) => "getblocktxn",
            Message::BlockTxn(_) => "blocktxn",
            Message::Reject(_) => "reject",
            Message::GetBlocks { .. } => "getblocks",
            Message::Blocks(_) => "blocks",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use crate::core::transaction::{OutPoint, TransactionBuilder, COIN};
    use crate::crypto::double_sha256;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        if let Message::Ping(nonce) = decoded {
            assert_eq!(nonce, 12345);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_transaction_travels_as_hex() {
        let tx = TransactionBuilder::new()
            .add_input(OutPoint::new(double_sha256(b"prev"), 1))
            .add_output(COIN, Script::new_p2pkh(&[7u8; 20]))
            .build();
        let bytes = Message::Tx(tx.clone()).to_bytes().unwrap();
        let json = String::from_utf8(bytes.clone()).unwrap();
        assert!(json.contains(&tx.to_hex()));

        match Message::from_bytes(&bytes).unwrap() {
            Message::Tx(decoded) => assert_eq!(decoded.txid(), tx.txid()),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_reject_message_codes() {
        let hash = double_sha256(b"block");
        let reject = RejectMessage::block(&Rejection::invalid("bad-blk-length"), hash);
        assert_eq!(reject.code, 16);
        assert_eq!(reject.message, "block");
        assert_eq!(reject.to_rejection().to_string(), "16: bad-blk-length");

        let uncoded = RejectMessage::tx(&Rejection::missing_inputs(), hash);
        assert_eq!(uncoded.code, 0);
        assert!(uncoded.to_rejection().is_missing_inputs());
    }

    #[test]
    fn test_handshake() {
        let handshake = Handshake::new("regtest", 100, Hash256::ZERO, 18444);
        assert_eq!(handshake.version, PROTOCOL_VERSION);
        assert_eq!(handshake.height, 100);
        assert!(handshake.user_agent.starts_with("admission-node/"));
    }
}
