use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blockchain::block::Block;
use crate::tx::{Transaction, TxRejected, TxType};
use crate::wallet::{Account, Wallet, WalletSnapshot};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown parent block {0}")]
    UnknownParent(String),
    #[error("invalid index {got} (expected {expected})")]
    InvalidIndex { got: u64, expected: u64 },
    #[error("block hash mismatch at index {0}")]
    HashMismatch(u64),
    #[error("genesis block mismatch")]
    GenesisMismatch,
    #[error("broken chain link at index {0}")]
    BrokenLink(u64),
    #[error("transaction in block {index} rejected: {source}")]
    TxFailed {
        index: u64,
        #[source]
        source: TxRejected,
    },
    #[error("reorganization failed: {0}")]
    ReorgFailed(String),
}

/// Payload handed to reorg listeners after a successful reorganization.
/// `removed` holds the blocks dropped from the old main chain, ordered from
/// just above the common ancestor to the old tip; `chain` is the new main
/// chain from genesis to the new head.
pub struct ReorgEvent<'a> {
    pub removed: &'a [Block],
    pub chain: &'a [Block],
}

pub type ReorgListener = Box<dyn FnMut(ReorgEvent<'_>) + Send>;

/// Fork-aware chain store.
///
/// Owns the main chain vector, the index of every block ever accepted, and
/// the wallet that always reflects exactly the cumulative effect of the main
/// chain applied to the retained genesis state.
pub struct Chain {
    blocks_by_hash: HashMap<String, Block>,
    chain: Vec<Block>,
    wallet: Wallet,
    genesis_state: WalletSnapshot,
    reorg_listeners: Vec<ReorgListener>,
}

/// Pure per-transaction check against a wallet, shared by block validation
/// and the node's send/receive path.
fn check_tx(wallet: &Wallet, tx: &Transaction) -> Result<(), TxRejected> {
    if tx.amount <= 0.0 {
        return Err(TxRejected::NonPositiveAmount(tx.amount));
    }
    match tx.kind {
        TxType::Transfer | TxType::Stake => {
            if wallet.get_balance(&tx.sender) < tx.amount {
                return Err(TxRejected::InsufficientBalance(tx.sender.clone()));
            }
        }
        TxType::Unstake => {
            if wallet.get_stake(&tx.sender) < tx.amount {
                return Err(TxRejected::InsufficientStake(tx.sender.clone()));
            }
        }
    }
    Ok(())
}

/// Apply a single transaction. The wallet mutations are total, so a failed
/// precondition leaves the wallet exactly as it was.
fn apply_tx(wallet: &mut Wallet, tx: &Transaction) -> Result<(), TxRejected> {
    if tx.amount <= 0.0 {
        return Err(TxRejected::NonPositiveAmount(tx.amount));
    }
    match tx.kind {
        TxType::Transfer => {
            if !wallet.withdraw(&tx.sender, tx.amount) {
                return Err(TxRejected::InsufficientBalance(tx.sender.clone()));
            }
            wallet.deposit(&tx.receiver, tx.amount);
        }
        TxType::Stake => {
            if !wallet.stake_tokens(&tx.sender, tx.amount) {
                return Err(TxRejected::InsufficientBalance(tx.sender.clone()));
            }
        }
        TxType::Unstake => {
            if !wallet.unstake_tokens(&tx.sender, tx.amount) {
                return Err(TxRejected::InsufficientStake(tx.sender.clone()));
            }
        }
    }
    Ok(())
}

fn apply_block_to_wallet(wallet: &mut Wallet, block: &Block) -> Result<(), ChainError> {
    for tx in &block.transactions {
        apply_tx(wallet, tx).map_err(|source| ChainError::TxFailed {
            index: block.index,
            source,
        })?;
    }
    Ok(())
}

impl Chain {
    pub fn new(initial_state: &WalletSnapshot) -> Self {
        let genesis = Block::genesis();
        let mut blocks_by_hash = HashMap::new();
        blocks_by_hash.insert(genesis.hash.clone(), genesis.clone());
        Self {
            blocks_by_hash,
            chain: vec![genesis],
            wallet: Wallet::from_state(initial_state),
            genesis_state: initial_state.clone(),
            reorg_listeners: Vec::new(),
        }
    }

    /// Rebuild a chain from a stored block sequence (disk snapshot).
    /// The sequence must start at our genesis, link correctly, and replay
    /// cleanly from the genesis state.
    pub fn from_blocks(
        initial_state: &WalletSnapshot,
        blocks: Vec<Block>,
    ) -> Result<Self, ChainError> {
        let mut chain = Self::new(initial_state);
        let wallet = chain.replay(&blocks)?;
        chain.chain = blocks;
        chain.blocks_by_hash = chain
            .chain
            .iter()
            .map(|b| (b.hash.clone(), b.clone()))
            .collect();
        chain.wallet = wallet;
        Ok(chain)
    }

    pub fn head(&self) -> &Block {
        self.chain.last().expect("chain always contains genesis")
    }

    pub fn height(&self) -> u64 {
        self.head().index
    }

    /// The main chain, genesis first.
    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    /// Every stored block, main chain and fork tips alike.
    pub fn all_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks_by_hash.values()
    }

    pub fn contains_block(&self, hash: &str) -> bool {
        self.blocks_by_hash.contains_key(hash)
    }

    pub fn balance(&self, account_id: &str) -> f64 {
        self.wallet.get_balance(account_id)
    }

    pub fn stake(&self, account_id: &str) -> f64 {
        self.wallet.get_stake(account_id)
    }

    pub fn wallet_info(&self) -> &BTreeMap<String, Account> {
        self.wallet.all_accounts()
    }

    /// Check a pending transaction against the live wallet.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), TxRejected> {
        check_tx(&self.wallet, tx)
    }

    pub fn register_reorg_listener(&mut self, listener: ReorgListener) {
        self.reorg_listeners.push(listener);
    }

    /// Pure block validation. Rules:
    /// 1. index 0 is accepted iff it is bit-for-bit our genesis;
    /// 2. the parent must be known;
    /// 3. the index must follow the parent;
    /// 4. the recomputed hash must match the claimed hash;
    /// 5. the transactions must replay against the wallet state at the
    ///    parent (live wallet clone if the parent is the head, otherwise a
    ///    fresh replay from the genesis state along the parent's branch).
    pub fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        if block.index == 0 {
            return if block.hash == self.chain[0].hash {
                Ok(())
            } else {
                Err(ChainError::GenesisMismatch)
            };
        }

        let parent = self
            .blocks_by_hash
            .get(&block.prev_hash)
            .ok_or_else(|| ChainError::UnknownParent(block.prev_hash.clone()))?;

        if block.index != parent.index + 1 {
            return Err(ChainError::InvalidIndex {
                got: block.index,
                expected: parent.index + 1,
            });
        }

        if block.compute_hash() != block.hash {
            return Err(ChainError::HashMismatch(block.index));
        }

        let mut scratch = self.wallet_at(parent)?;
        apply_block_to_wallet(&mut scratch, block)
    }

    /// Wallet state as of `parent`. Clones the live wallet when the parent
    /// is the current head; otherwise replays the parent's branch from the
    /// genesis state.
    fn wallet_at(&self, parent: &Block) -> Result<Wallet, ChainError> {
        if parent.hash == self.head().hash {
            return Ok(self.wallet.clone());
        }

        let mut branch: Vec<&Block> = Vec::new();
        let mut cur = parent;
        while cur.index != 0 {
            branch.push(cur);
            cur = self
                .blocks_by_hash
                .get(&cur.prev_hash)
                .ok_or_else(|| ChainError::UnknownParent(cur.prev_hash.clone()))?;
        }
        branch.reverse();

        let mut wallet = Wallet::from_state(&self.genesis_state);
        for block in branch {
            apply_block_to_wallet(&mut wallet, block)?;
        }
        Ok(wallet)
    }

    /// Insert a validated block. Extends the main chain when it builds on
    /// the head, triggers a reorganization when it outgrows the head on a
    /// fork, and is otherwise stored as a side-branch block.
    pub fn apply_block(&mut self, block: Block) -> Result<(), ChainError> {
        self.validate_block(&block)?;

        self.blocks_by_hash.insert(block.hash.clone(), block.clone());

        if block.prev_hash == self.head().hash {
            let mut scratch = self.wallet.clone();
            apply_block_to_wallet(&mut scratch, &block)?;
            self.wallet = scratch;
            info!("block {} ({}) appended to main chain", block.index, block.short_hash());
            self.chain.push(block);
            Ok(())
        } else if block.index > self.head().index {
            info!(
                "fork block {} ({}) is past the current head {}, reorganizing",
                block.index,
                block.short_hash(),
                self.head().index
            );
            self.reorganize_around(block)
        } else {
            debug!(
                "fork block {} ({}) stored, main chain unchanged",
                block.index,
                block.short_hash()
            );
            Ok(())
        }
    }

    /// Reorganize to the branch ending in `new_head`, which must connect to
    /// the main chain through stored blocks. The walk stops at the first
    /// block already on the main chain: the common ancestor, whose index is
    /// its position in the chain vector.
    fn reorganize_around(&mut self, new_head: Block) -> Result<(), ChainError> {
        let main: HashSet<String> = self.chain.iter().map(|b| b.hash.clone()).collect();

        let mut branch: Vec<Block> = Vec::new();
        let mut cur = new_head;
        while !main.contains(&cur.hash) {
            let parent = self
                .blocks_by_hash
                .get(&cur.prev_hash)
                .cloned()
                .ok_or_else(|| ChainError::UnknownParent(cur.prev_hash.clone()))?;
            branch.push(cur);
            cur = parent;
        }
        branch.reverse();

        let ancestor_index = cur.index as usize;
        let mut candidate = self.chain[..=ancestor_index].to_vec();
        candidate.extend(branch);
        self.apply_reorg(candidate, ancestor_index)
    }

    /// Adopt a caller-supplied chain (sync). Does nothing when the chains
    /// share no ancestor.
    pub fn reorganize_to(&mut self, new_chain: &[Block]) -> Result<(), ChainError> {
        if new_chain.is_empty() {
            warn!("empty chain passed to reorganize_to, ignoring");
            return Ok(());
        }

        let candidate_hashes: HashSet<&str> =
            new_chain.iter().map(|b| b.hash.as_str()).collect();
        let ancestor_index = match self
            .chain
            .iter()
            .rposition(|b| candidate_hashes.contains(b.hash.as_str()))
        {
            Some(i) => i,
            None => {
                info!("no common ancestor with the offered chain, keeping ours");
                return Ok(());
            }
        };

        self.apply_reorg(new_chain.to_vec(), ancestor_index)
    }

    /// Replay-validate the candidate and atomically swap it in. Either the
    /// whole new state becomes visible and listeners run, or the error is
    /// returned with the live state untouched.
    fn apply_reorg(
        &mut self,
        candidate: Vec<Block>,
        ancestor_index: usize,
    ) -> Result<(), ChainError> {
        let new_wallet = self.replay(&candidate)?;

        let removed: Vec<Block> = self.chain[ancestor_index + 1..].to_vec();

        self.chain = candidate;
        self.blocks_by_hash = self
            .chain
            .iter()
            .map(|b| (b.hash.clone(), b.clone()))
            .collect();
        self.wallet = new_wallet;

        info!(
            "reorganized: new head {} at height {}, {} block(s) removed",
            self.head().short_hash().to_string(),
            self.head().index,
            removed.len()
        );

        let chain = &self.chain;
        for listener in self.reorg_listeners.iter_mut() {
            listener(ReorgEvent {
                removed: &removed,
                chain,
            });
        }
        Ok(())
    }

    /// Validate an entire candidate chain from genesis and compute the
    /// wallet it produces. Verifies genesis fixity, link continuity, hash
    /// integrity, and transaction replay; mutates nothing.
    fn replay(&self, candidate: &[Block]) -> Result<Wallet, ChainError> {
        let first = candidate
            .first()
            .ok_or_else(|| ChainError::ReorgFailed("empty candidate chain".into()))?;
        if first.hash != self.chain[0].hash {
            return Err(ChainError::GenesisMismatch);
        }

        let mut wallet = Wallet::from_state(&self.genesis_state);
        for (prev, block) in candidate.iter().zip(candidate.iter().skip(1)) {
            if block.prev_hash != prev.hash || block.index != prev.index + 1 {
                return Err(ChainError::BrokenLink(block.index));
            }
            if block.compute_hash() != block.hash {
                return Err(ChainError::HashMismatch(block.index));
            }
            apply_block_to_wallet(&mut wallet, block)?;
        }
        Ok(wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Transaction;

    fn state(entries: &[(&str, f64, f64)]) -> WalletSnapshot {
        entries
            .iter()
            .map(|(id, balance, stake)| {
                (id.to_string(), Account { balance: *balance, stake: *stake })
            })
            .collect()
    }

    fn transfer(from: &str, to: &str, amount: f64, ts: f64) -> Transaction {
        Transaction::with_timestamp(from, to, amount, ts, TxType::Transfer)
    }

    fn child(parent: &Block, validator: &str, txs: Vec<Transaction>, ts: f64) -> Block {
        Block::with_timestamp(parent.index + 1, parent.hash.clone(), validator, txs, ts)
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.head().validator, "genesis");
        assert_eq!(chain.balance("a"), 100.0);
    }

    #[test]
    fn test_apply_extends_head() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let b1 = child(chain.head(), "a", vec![transfer("a", "b", 40.0, 10.0)], 11.0);
        chain.apply_block(b1).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.balance("a"), 60.0);
        assert_eq!(chain.balance("b"), 40.0);
    }

    #[test]
    fn test_validate_rejects_unknown_parent() {
        let chain = Chain::new(&state(&[]));
        let orphan = Block::with_timestamp(1, "f".repeat(64), "a", vec![], 1.0);
        assert!(matches!(
            chain.validate_block(&orphan),
            Err(ChainError::UnknownParent(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_index() {
        let chain = Chain::new(&state(&[]));
        let block = Block::with_timestamp(2, chain.head().hash.clone(), "a", vec![], 1.0);
        assert!(matches!(
            chain.validate_block(&block),
            Err(ChainError::InvalidIndex { got: 2, expected: 1 })
        ));
    }

    #[test]
    fn test_validate_rejects_tampered_hash() {
        let chain = Chain::new(&state(&[("a", 10.0, 0.0)]));
        let mut block = child(chain.head(), "a", vec![transfer("a", "b", 1.0, 5.0)], 6.0);
        block.transactions[0].amount = 2.0; // hash no longer matches
        assert!(matches!(
            chain.validate_block(&block),
            Err(ChainError::HashMismatch(1))
        ));
    }

    #[test]
    fn test_validate_rejects_overspend() {
        let chain = Chain::new(&state(&[("a", 10.0, 0.0)]));
        let block = child(chain.head(), "a", vec![transfer("a", "b", 11.0, 5.0)], 6.0);
        assert!(matches!(
            chain.validate_block(&block),
            Err(ChainError::TxFailed { index: 1, .. })
        ));
    }

    #[test]
    fn test_wrong_genesis_rejected() {
        let chain = Chain::new(&state(&[]));
        let fake = Block::with_timestamp(0, "0".repeat(64), "genesis", vec![], 1.0);
        assert!(matches!(
            chain.validate_block(&fake),
            Err(ChainError::GenesisMismatch)
        ));
        assert!(chain.validate_block(&Block::genesis()).is_ok());
    }

    #[test]
    fn test_short_fork_is_stored_not_switched() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let b1 = child(chain.head(), "a", vec![transfer("a", "b", 10.0, 10.0)], 11.0);
        let b2 = child(&b1, "a", vec![transfer("a", "b", 10.0, 20.0)], 21.0);
        chain.apply_block(b1.clone()).unwrap();
        chain.apply_block(b2).unwrap();

        // Competing block at height 1 off genesis
        let f1 = child(&chain.blocks()[0].clone(), "c", vec![transfer("a", "c", 5.0, 12.0)], 13.0);
        chain.apply_block(f1.clone()).unwrap();

        assert_eq!(chain.height(), 2);
        assert!(chain.contains_block(&f1.hash));
        assert_eq!(chain.balance("c"), 0.0); // fork not applied
    }

    #[test]
    fn test_longer_fork_triggers_reorg() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let genesis = chain.blocks()[0].clone();

        let b1 = child(&genesis, "a", vec![transfer("a", "b", 10.0, 10.0)], 11.0);
        chain.apply_block(b1).unwrap();

        // Fork: two blocks off genesis
        let f1 = child(&genesis, "c", vec![transfer("a", "c", 5.0, 12.0)], 13.0);
        let f2 = child(&f1, "c", vec![transfer("a", "c", 5.0, 14.0)], 15.0);
        chain.apply_block(f1.clone()).unwrap();
        assert_eq!(chain.height(), 1); // stored only

        chain.apply_block(f2.clone()).unwrap();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.head().hash, f2.hash);
        assert_eq!(chain.balance("c"), 10.0);
        assert_eq!(chain.balance("b"), 0.0); // old branch undone
    }

    #[test]
    fn test_reorg_listener_receives_removed_blocks() {
        use std::sync::{Arc, Mutex};

        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let genesis = chain.blocks()[0].clone();

        let removed_log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let log = removed_log.clone();
        chain.register_reorg_listener(Box::new(move |ev| {
            log.lock().unwrap().extend(ev.removed.iter().map(|b| b.index));
        }));

        let b1 = child(&genesis, "a", vec![transfer("a", "b", 10.0, 10.0)], 11.0);
        chain.apply_block(b1.clone()).unwrap();

        let f1 = child(&genesis, "c", vec![transfer("a", "c", 5.0, 12.0)], 13.0);
        let f2 = child(&f1, "c", vec![transfer("a", "c", 5.0, 14.0)], 15.0);
        chain.apply_block(f1).unwrap();
        chain.apply_block(f2).unwrap();

        assert_eq!(*removed_log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_reorganize_to_without_common_ancestor_is_noop() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let b1 = child(chain.head(), "a", vec![transfer("a", "b", 10.0, 10.0)], 11.0);
        chain.apply_block(b1.clone()).unwrap();

        // A chain from a different genesis shares nothing with ours
        let alien_genesis = Block::with_timestamp(0, "1".repeat(64), "genesis", vec![], 0.0);
        let alien = child(&alien_genesis, "x", vec![], 1.0);
        chain.reorganize_to(&[alien_genesis, alien]).unwrap();

        assert_eq!(chain.head().hash, b1.hash);
    }

    #[test]
    fn test_reorg_atomic_on_invalid_candidate() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let genesis = chain.blocks()[0].clone();
        let b1 = child(&genesis, "a", vec![transfer("a", "b", 10.0, 10.0)], 11.0);
        chain.apply_block(b1.clone()).unwrap();

        // Candidate with a transaction that cannot replay (overspend)
        let c1 = child(&genesis, "c", vec![transfer("a", "c", 500.0, 12.0)], 13.0);
        let c2 = child(&c1, "c", vec![], 14.0);
        let err = chain.reorganize_to(&[genesis, c1, c2]);
        assert!(err.is_err());

        // Live state untouched
        assert_eq!(chain.head().hash, b1.hash);
        assert_eq!(chain.balance("a"), 90.0);
        assert_eq!(chain.balance("b"), 10.0);
    }

    #[test]
    fn test_wallet_equals_replay() {
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0), ("b", 50.0, 0.0)]));
        let b1 = child(
            chain.head(),
            "a",
            vec![
                transfer("a", "b", 10.0, 10.0),
                Transaction::with_timestamp("b", "b", 20.0, 10.0, TxType::Stake),
            ],
            11.0,
        );
        chain.apply_block(b1).unwrap();
        let b2 = child(
            chain.head(),
            "b",
            vec![Transaction::with_timestamp("b", "b", 5.0, 20.0, TxType::Unstake)],
            21.0,
        );
        chain.apply_block(b2).unwrap();

        let replayed = Chain::from_blocks(
            &state(&[("a", 100.0, 0.0), ("b", 50.0, 0.0)]),
            chain.blocks().to_vec(),
        )
        .unwrap();
        assert_eq!(replayed.wallet_info(), chain.wallet_info());
        assert_eq!(chain.balance("b"), 45.0);
        assert_eq!(chain.stake("b"), 15.0);
    }

    #[test]
    fn test_fork_validation_replays_branch_state() {
        // A block on a fork must be validated against the fork's state, not
        // the live wallet.
        let mut chain = Chain::new(&state(&[("a", 100.0, 0.0)]));
        let genesis = chain.blocks()[0].clone();

        // Main chain: a spends 90
        let b1 = child(&genesis, "a", vec![transfer("a", "b", 90.0, 10.0)], 11.0);
        chain.apply_block(b1).unwrap();

        // Fork off genesis where a still has 100: spending 50 is valid there
        let f1 = child(&genesis, "c", vec![transfer("a", "c", 50.0, 12.0)], 13.0);
        assert!(chain.validate_block(&f1).is_ok());
        // but spending 95 then 95 again on the same fork is not
        let g1 = child(&genesis, "c", vec![transfer("a", "c", 95.0, 12.0)], 13.5);
        chain.apply_block(g1.clone()).unwrap();
        let g2 = child(&g1, "c", vec![transfer("a", "c", 95.0, 14.0)], 15.0);
        assert!(chain.validate_block(&g2).is_err());
    }
}
