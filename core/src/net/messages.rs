use serde::{Deserialize, Serialize};

use crate::blockchain::Block;
use crate::tx::Transaction;

/// A vote for a proposed block, identified by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVote {
    pub voter_id: String,
    pub block_hash: String,
}

/// Everything that crosses the relay. Frames carry a bincode-encoded
/// `Message`; the enum discriminant is the wire type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Hello { sender_id: String },
    Bye { sender_id: String },
    Step { sender_id: String },
    Transaction { sender_id: String, tx: Transaction },
    Block { sender_id: String, block: Block },
    BlockVote { sender_id: String, vote: BlockVote },
    SyncRequest { sender_id: String },
    SyncResponse { sender_id: String, blocks: Vec<Block> },
}

impl Message {
    pub fn sender_id(&self) -> &str {
        match self {
            Message::Hello { sender_id }
            | Message::Bye { sender_id }
            | Message::Step { sender_id }
            | Message::Transaction { sender_id, .. }
            | Message::Block { sender_id, .. }
            | Message::BlockVote { sender_id, .. }
            | Message::SyncRequest { sender_id }
            | Message::SyncResponse { sender_id, .. } => sender_id,
        }
    }

    /// Wire type name, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Bye { .. } => "BYE",
            Message::Step { .. } => "STEP",
            Message::Transaction { .. } => "TRANSACTION",
            Message::Block { .. } => "BLOCK",
            Message::BlockVote { .. } => "BLOCK_VOTE",
            Message::SyncRequest { .. } => "SYNC_REQUEST",
            Message::SyncResponse { .. } => "SYNC_RESPONSE",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
