use std::collections::HashSet;

use crate::blockchain::block::Block;
use crate::tx::Transaction;

/// Per-node queue of unconfirmed transactions, in arrival order.
///
/// Deduplication uses the transactions' loose equality (whole-second
/// timestamps, 1e-9 amount tolerance). Eviction happens when a block lands
/// on the main chain; re-insertion happens on reorg for transactions that
/// fell out of the chain.
#[derive(Debug, Default)]
pub struct Mempool {
    txs: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless an equal transaction is already pending.
    pub fn push(&mut self, tx: Transaction) -> bool {
        if self.txs.contains(&tx) {
            return false;
        }
        self.txs.push(tx);
        true
    }

    pub fn contains(&self, tx: &Transaction) -> bool {
        self.txs.contains(tx)
    }

    /// Drop every pending transaction included in the given block.
    pub fn remove_included(&mut self, block: &Block) {
        self.txs.retain(|tx| !block.transactions.contains(tx));
    }

    /// Drop every pending transaction whose identity is in `confirmed`.
    pub fn remove_confirmed(&mut self, confirmed: &HashSet<String>) {
        self.txs.retain(|tx| !confirmed.contains(&tx.tx_id()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn clear(&mut self) {
        self.txs.clear();
    }
}
