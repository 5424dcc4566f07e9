use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Two amounts closer than this are considered equal. Transactions travel as
/// doubles, so sub-nanotoken noise from serialization must not break dedup.
pub const AMOUNT_TOLERANCE: f64 = 1e-9;

/// Current wall-clock time as fractional seconds since the epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Why a transaction was refused at send or receive time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TxRejected {
    #[error("amount must be positive (got {0})")]
    NonPositiveAmount(f64),
    #[error("insufficient balance for {0}")]
    InsufficientBalance(String),
    #[error("insufficient stake for {0}")]
    InsufficientStake(String),
    #[error("transfer to self is not allowed")]
    SelfTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Transfer,
    Stake,
    Unstake,
}

impl TxType {
    pub fn name(&self) -> &'static str {
        match self {
            TxType::Transfer => "TRANSFER",
            TxType::Stake => "STAKE",
            TxType::Unstake => "UNSTAKE",
        }
    }
}

/// An unsigned token movement. STAKE and UNSTAKE are modeled as
/// self-transfers (sender == receiver).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: TxType,
}

impl Transaction {
    pub fn new(sender: &str, receiver: &str, amount: f64, kind: TxType) -> Self {
        Self::with_timestamp(sender, receiver, amount, unix_now(), kind)
    }

    pub fn with_timestamp(
        sender: &str,
        receiver: &str,
        amount: f64,
        timestamp: f64,
        kind: TxType,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            timestamp,
            kind,
        }
    }

    /// Canonical identity string. The timestamp is floored to whole seconds
    /// so sub-second noise does not split a transaction into two identities.
    pub fn canonical(&self) -> String {
        format!(
            "{} -> {} : {} @ {}",
            self.sender,
            self.receiver,
            self.amount,
            self.timestamp.floor() as i64
        )
    }

    /// Stable transaction identity: SHA-256 over the canonical string.
    pub fn tx_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }

    /// STAKE/UNSTAKE are self-transfers by construction; a self TRANSFER is
    /// rejected at send time but still classified here for the detector.
    pub fn is_self_transfer(&self) -> bool {
        self.sender == self.receiver
    }
}

/// Equality is loose: 1 s of timestamp tolerance (whole-second identity) and
/// amounts compared within `AMOUNT_TOLERANCE`. This is the dedup relation
/// used by the mempool.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender
            && self.receiver == other.receiver
            && self.kind == other.kind
            && (self.amount - other.amount).abs() < AMOUNT_TOLERANCE
            && self.timestamp.floor() as i64 == other.timestamp.floor() as i64
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} {} ({})",
            self.sender,
            self.receiver,
            self.amount,
            self.kind.name()
        )
    }
}
