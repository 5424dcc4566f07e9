use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tx::{unix_now, Transaction};

/// prev_hash of the genesis block: 64 zeros.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Validator id recorded in the genesis block.
pub const GENESIS_VALIDATOR: &str = "genesis";

/// A block in the chain. The hash is computed once at construction; any
/// block received over the wire or from disk carries its claimed hash and
/// every validation path recomputes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub prev_hash: String,
    pub timestamp: f64,
    pub validator: String,
    pub transactions: Vec<Transaction>,
    pub hash: String,
}

impl Block {
    pub fn new(
        index: u64,
        prev_hash: String,
        validator: &str,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self::with_timestamp(index, prev_hash, validator, transactions, unix_now())
    }

    pub fn with_timestamp(
        index: u64,
        prev_hash: String,
        validator: &str,
        transactions: Vec<Transaction>,
        timestamp: f64,
    ) -> Self {
        let mut block = Self {
            index,
            prev_hash,
            timestamp,
            validator: validator.to_string(),
            transactions,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The fixed genesis block: index 0, all-zero parent, no transactions,
    /// validator "genesis", timestamp 0. Identical on every node.
    pub fn genesis() -> Self {
        Self::with_timestamp(0, GENESIS_PREV_HASH.to_string(), GENESIS_VALIDATOR, vec![], 0.0)
    }

    /// SHA-256 over index, prev_hash, timestamp, validator, and the
    /// concatenated canonical strings of the transactions.
    pub fn compute_hash(&self) -> String {
        let tx_str: String = self
            .transactions
            .iter()
            .map(|tx| tx.canonical())
            .collect::<Vec<_>>()
            .concat();
        let block_string = format!(
            "{}{}{}{}{}",
            self.index, self.prev_hash, self.timestamp, self.validator, tx_str
        );
        hex::encode(Sha256::digest(block_string.as_bytes()))
    }

    /// First 8 hex chars of the hash, for log lines.
    pub fn short_hash(&self) -> &str {
        &self.hash[..8.min(self.hash.len())]
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block {} | validator={} | txs={} | hash={}...",
            self.index,
            self.validator,
            self.transactions.len(),
            self.short_hash()
        )
    }
}
