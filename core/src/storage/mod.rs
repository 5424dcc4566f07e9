//! On-disk chain snapshots.
//!
//! A node's state lives in `<data_dir>/blocks.json`: a JSON array of blocks
//! from genesis to head. Persistence is a whole-file rewrite on shutdown;
//! loading replays the file against the genesis state and a corrupt or
//! invalid snapshot degrades to a fresh genesis-only chain at the caller.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::blockchain::{Block, Chain};
use crate::wallet::WalletSnapshot;

const BLOCKS_FILE: &str = "blocks.json";

/// Write the main chain to `<dir>/blocks.json`, creating the directory as
/// needed.
pub fn save_chain(dir: &Path, chain: &Chain) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating data dir {}", dir.display()))?;
    let path = dir.join(BLOCKS_FILE);
    let json = serde_json::to_string_pretty(chain.blocks())?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!("chain saved to {}", path.display());
    Ok(())
}

/// Load and replay a stored chain. Errors cover a missing file, bad JSON,
/// and a snapshot that fails replay against `initial_state`.
pub fn load_chain(dir: &Path, initial_state: &WalletSnapshot) -> Result<Chain> {
    let path = dir.join(BLOCKS_FILE);
    let json = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let blocks: Vec<Block> = serde_json::from_str(&json)
        .with_context(|| format!("parsing {}", path.display()))?;
    let chain = Chain::from_blocks(initial_state, blocks)
        .with_context(|| format!("replaying {}", path.display()))?;
    info!(
        "chain loaded from {} (height {})",
        path.display(),
        chain.height()
    );
    Ok(chain)
}

/// Does a snapshot exist for this data directory?
pub fn snapshot_exists(dir: &Path) -> bool {
    dir.join(BLOCKS_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{Transaction, TxType};
    use crate::wallet::Account;

    fn initial() -> WalletSnapshot {
        [("a".to_string(), Account { balance: 100.0, stake: 0.0 })]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = initial();
        let mut chain = Chain::new(&state);
        let b1 = Block::with_timestamp(
            1,
            chain.head().hash.clone(),
            "a",
            vec![Transaction::with_timestamp("a", "b", 25.0, 10.0, TxType::Transfer)],
            11.0,
        );
        chain.apply_block(b1).unwrap();

        save_chain(dir.path(), &chain).unwrap();
        assert!(snapshot_exists(dir.path()));

        let loaded = load_chain(dir.path(), &state).unwrap();
        assert_eq!(loaded.height(), 1);
        assert_eq!(loaded.head().hash, chain.head().hash);
        assert_eq!(loaded.balance("a"), 75.0);
        assert_eq!(loaded.balance("b"), 25.0);
    }

    #[test]
    fn test_missing_snapshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!snapshot_exists(dir.path()));
        assert!(load_chain(dir.path(), &initial()).is_err());
    }

    #[test]
    fn test_corrupt_snapshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(BLOCKS_FILE), b"{not json").unwrap();
        assert!(load_chain(dir.path(), &initial()).is_err());
    }

    #[test]
    fn test_tampered_snapshot_fails_replay() {
        let dir = tempfile::tempdir().unwrap();
        let state = initial();
        let mut chain = Chain::new(&state);
        let b1 = Block::with_timestamp(
            1,
            chain.head().hash.clone(),
            "a",
            vec![Transaction::with_timestamp("a", "b", 25.0, 10.0, TxType::Transfer)],
            11.0,
        );
        chain.apply_block(b1).unwrap();
        save_chain(dir.path(), &chain).unwrap();

        // Flip an amount on disk; the stored hash no longer matches
        let path = dir.path().join(BLOCKS_FILE);
        let tampered = fs::read_to_string(&path).unwrap().replace("25.0", "75.0");
        fs::write(&path, tampered).unwrap();
        assert!(load_chain(dir.path(), &state).is_err());
    }

    #[test]
    fn test_json_field_names() {
        // The on-disk contract: blocks carry index, prev_hash, timestamp,
        // validator, transactions, hash; transactions carry sender,
        // receiver, amount, timestamp, type.
        let state = initial();
        let mut chain = Chain::new(&state);
        let b1 = Block::with_timestamp(
            1,
            chain.head().hash.clone(),
            "a",
            vec![Transaction::with_timestamp("a", "b", 25.0, 10.0, TxType::Transfer)],
            11.0,
        );
        chain.apply_block(b1).unwrap();

        let json = serde_json::to_value(chain.blocks()).unwrap();
        let block = &json[1];
        for field in ["index", "prev_hash", "timestamp", "validator", "transactions", "hash"] {
            assert!(block.get(field).is_some(), "missing block field {field}");
        }
        let tx = &block["transactions"][0];
        for field in ["sender", "receiver", "amount", "timestamp", "type"] {
            assert!(tx.get(field).is_some(), "missing tx field {field}");
        }
        assert_eq!(tx["type"], "TRANSFER");
    }
}
