//! The PoS node: one chain store, one mempool, one relay connection.
//!
//! All state lives behind a single event loop — inbound relay messages,
//! shell commands, and timer callbacks are serialized through it, so the
//! handlers below never race each other. Timers are plain spawned sleeps
//! that feed a `TimerEvent` back into the loop; a timer firing for state
//! that no longer exists is a no-op, which makes cancellation idempotent.

pub mod commands;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::blockchain::{consensus, Block, Chain};
use crate::config::{Config, SyncConfig, VoteConfig};
use crate::mempool::Mempool;
use crate::net::messages::{BlockVote, Message};
use crate::net::RelayClient;
use crate::storage;
use crate::tx::{Transaction, TxRejected, TxType};

/// Sender id the relay uses for its own messages.
pub const SERVER_ID: &str = "server";

/// Deferred callbacks delivered through the node's event loop.
#[derive(Debug)]
pub enum TimerEvent {
    VoteTimeout { block_hash: String },
    SyncTimeout,
}

struct PendingBlock {
    block: Block,
    votes: HashSet<String>,
}

pub struct Node {
    id: String,
    data_dir: PathBuf,
    chain: Chain,
    mempool: Arc<Mutex<Mempool>>,
    known_nodes: HashSet<String>,
    client: RelayClient,
    timers: mpsc::UnboundedSender<TimerEvent>,
    sync_cfg: SyncConfig,
    vote_cfg: VoteConfig,
    sync_in_progress: bool,
    sync_responses: Vec<(String, Vec<Block>)>,
    pending_blocks: HashMap<String, PendingBlock>,
    should_exit: bool,
}

impl Node {
    /// Build a node, restoring the chain from `<data_dir>/blocks.json` when
    /// a snapshot exists. A snapshot that fails to load degrades to a fresh
    /// genesis-only chain.
    pub fn new(
        id: &str,
        config: &Config,
        data_dir: PathBuf,
        client: RelayClient,
        timers: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        let mut chain = if storage::snapshot_exists(&data_dir) {
            match storage::load_chain(&data_dir, &config.initial_state) {
                Ok(chain) => chain,
                Err(e) => {
                    error!("failed to load chain snapshot, starting fresh: {:#}", e);
                    Chain::new(&config.initial_state)
                }
            }
        } else {
            Chain::new(&config.initial_state)
        };

        let mempool = Arc::new(Mutex::new(Mempool::new()));

        // Reorg recovery: transactions dropped with the old branch re-enter
        // the mempool unless the adopted chain already confirms them, and
        // anything the new chain confirms is evicted.
        let pool = mempool.clone();
        chain.register_reorg_listener(Box::new(move |ev| {
            let mut pool = pool.lock().unwrap();
            let confirmed: HashSet<String> = ev
                .chain
                .iter()
                .flat_map(|b| b.transactions.iter().map(|tx| tx.tx_id()))
                .collect();
            pool.remove_confirmed(&confirmed);
            for block in ev.removed {
                for tx in &block.transactions {
                    if !confirmed.contains(&tx.tx_id()) && pool.push(tx.clone()) {
                        info!("recovered tx into mempool: {}", tx);
                    }
                }
            }
        }));

        let mut known_nodes = HashSet::new();
        known_nodes.insert(id.to_string());

        info!(
            "node {} starting, chain length {} (excluding genesis)",
            id,
            chain.height()
        );

        Self {
            id: id.to_string(),
            data_dir,
            chain,
            mempool,
            known_nodes,
            client,
            timers,
            sync_cfg: config.sync.clone(),
            vote_cfg: config.vote.clone(),
            sync_in_progress: false,
            sync_responses: Vec::new(),
            pending_blocks: HashMap::new(),
            should_exit: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn known_nodes(&self) -> &HashSet<String> {
        &self.known_nodes
    }

    pub fn mempool_txs(&self) -> Vec<Transaction> {
        self.mempool.lock().unwrap().iter().cloned().collect()
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending_blocks.len()
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Kick off the bootstrap sync round.
    pub fn start(&mut self) {
        self.request_sync();
    }

    // ------------------------------------------------------------------
    // Inbound message dispatch
    // ------------------------------------------------------------------

    pub fn handle_message(&mut self, msg: Message) {
        debug!("dispatching {} from {}", msg.kind(), msg.sender_id());
        match msg {
            Message::Hello { sender_id } => self.on_hello(sender_id),
            Message::Bye { sender_id } => self.on_bye(sender_id),
            Message::Step { .. } => self.on_step(),
            Message::Transaction { tx, .. } => self.on_transaction(tx),
            Message::Block { block, .. } => self.on_block(block),
            Message::BlockVote { vote, .. } => self.on_block_vote(vote),
            Message::SyncRequest { sender_id } => self.on_sync_request(sender_id),
            Message::SyncResponse { sender_id, blocks } => {
                self.on_sync_response(sender_id, blocks)
            }
        }
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::VoteTimeout { block_hash } => self.on_vote_timeout(&block_hash),
            TimerEvent::SyncTimeout => self.process_sync_responses(),
        }
    }

    fn on_hello(&mut self, sender_id: String) {
        info!("HELLO from {}", sender_id);
        self.known_nodes.insert(sender_id);
    }

    fn on_bye(&mut self, sender_id: String) {
        info!("BYE from {}", sender_id);
        if sender_id == SERVER_ID {
            info!("relay is shutting down, exiting");
            self.shutdown();
            return;
        }
        self.known_nodes.remove(&sender_id);
    }

    fn on_step(&mut self) {
        debug!("STEP received, attempting to forge");
        self.forge_block(false);
    }

    fn on_transaction(&mut self, tx: Transaction) {
        if tx.sender == self.id {
            // Our own broadcast is already in the local mempool.
            return;
        }
        if let Err(e) = self.chain.validate_transaction(&tx) {
            warn!("rejected {} tx from {}: {}", tx.kind.name(), tx.sender, e);
            return;
        }
        info!("received {}: {}", tx.kind.name(), tx);
        self.mempool.lock().unwrap().push(tx);
    }

    fn on_block(&mut self, block: Block) {
        if self.chain.contains_block(&block.hash) {
            return;
        }

        if !self.vote_cfg.enabled {
            info!("[no voting] adding block {} from {}", block.index, block.validator);
            self.add_block(block);
            return;
        }

        if let Err(e) = self.chain.validate_block(&block) {
            warn!("block {} failed validation, rejecting: {}", block.index, e);
            return;
        }
        self.vote(&block);
        self.stash_pending(block.clone());
        self.schedule(
            Duration::from_secs_f64(self.vote_cfg.timeout),
            TimerEvent::VoteTimeout { block_hash: block.hash },
        );
    }

    fn on_block_vote(&mut self, vote: BlockVote) {
        let Some(pending) = self.pending_blocks.get_mut(&vote.block_hash) else {
            debug!(
                "vote from {} for unknown block {}, ignoring",
                vote.voter_id,
                &vote.block_hash[..8.min(vote.block_hash.len())]
            );
            return;
        };
        if self.chain.stake(&vote.voter_id) <= 0.0 {
            warn!("vote from non-validator {}, ignoring", vote.voter_id);
            return;
        }

        pending.votes.insert(vote.voter_id.clone());
        let votes = pending.votes.len();

        let online_validators = self
            .known_nodes
            .iter()
            .filter(|n| self.chain.stake(n) > 0.0)
            .count()
            .max(1);
        let ratio = votes as f64 / online_validators as f64;
        info!(
            "block {} vote ratio {:.2} ({}/{})",
            &vote.block_hash[..8.min(vote.block_hash.len())],
            ratio,
            votes,
            online_validators
        );

        if ratio >= self.vote_cfg.threshold {
            if let Some(pending) = self.pending_blocks.remove(&vote.block_hash) {
                info!(
                    "block {} ratified, applying",
                    pending.block.index
                );
                self.add_block(pending.block);
            }
        }
    }

    fn on_sync_request(&mut self, sender_id: String) {
        info!("SYNC_REQUEST from {}, sending chain", sender_id);
        self.client.send(Message::SyncResponse {
            sender_id: self.id.clone(),
            blocks: self.chain.blocks().to_vec(),
        });
    }

    fn on_sync_response(&mut self, sender_id: String, blocks: Vec<Block>) {
        self.known_nodes.insert(sender_id.clone());
        if !self.sync_in_progress {
            warn!("SYNC_RESPONSE from {} with no sync in progress, ignoring", sender_id);
            return;
        }
        info!(
            "SYNC_RESPONSE from {} with {} block(s)",
            sender_id,
            blocks.len()
        );
        self.sync_responses.push((sender_id, blocks));
    }

    fn on_vote_timeout(&mut self, block_hash: &str) {
        if self.pending_blocks.remove(block_hash).is_some() {
            warn!(
                "vote timeout for block {}, discarding pending state",
                &block_hash[..8.min(block_hash.len())]
            );
        }
    }

    // ------------------------------------------------------------------
    // Forge protocol
    // ------------------------------------------------------------------

    /// Attempt to produce a block. `force` skips the election check.
    pub fn forge_block(&mut self, force: bool) {
        if force {
            warn!("forcing block forge, skipping validator check");
        } else {
            match consensus::select_validator(&self.chain, &self.known_nodes) {
                Some(elected) if elected == self.id => {}
                elected => {
                    info!(
                        "not elected to forge this block (selected validator: {})",
                        elected.as_deref().unwrap_or("none")
                    );
                    return;
                }
            }
        }

        let packed = self.pack_transactions();
        if packed.is_empty() {
            info!("no valid transactions to pack, skipping forge");
            return;
        }

        let head = self.chain.head();
        let block = Block::new(head.index + 1, head.hash.clone(), &self.id, packed);
        info!("proposing block {} ({})", block.index, block.short_hash());
        self.client.send(Message::Block {
            sender_id: self.id.clone(),
            block: block.clone(),
        });

        if self.vote_cfg.enabled {
            if let Err(e) = self.chain.validate_block(&block) {
                warn!("own block {} failed validation: {}", block.index, e);
                return;
            }
            self.vote(&block);
            self.stash_pending(block.clone());
            self.schedule(
                Duration::from_secs_f64(self.vote_cfg.timeout),
                TimerEvent::VoteTimeout { block_hash: block.hash },
            );
        } else {
            self.add_block(block);
        }
    }

    /// Transactions from the mempool that still pass against the live
    /// wallet. Each is checked independently, mirroring send-time checks.
    fn pack_transactions(&self) -> Vec<Transaction> {
        self.mempool
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| self.chain.validate_transaction(tx).is_ok())
            .cloned()
            .collect()
    }

    fn vote(&self, block: &Block) {
        self.client.send(Message::BlockVote {
            sender_id: self.id.clone(),
            vote: BlockVote {
                voter_id: self.id.clone(),
                block_hash: block.hash.clone(),
            },
        });
        info!("voted to accept block {} ({})", block.index, block.short_hash());
    }

    /// Hold a block until its votes arrive. The proposer's own vote only
    /// counts when it actually is a validator.
    fn stash_pending(&mut self, block: Block) {
        let entry = self
            .pending_blocks
            .entry(block.hash.clone())
            .or_insert_with(|| PendingBlock { block, votes: HashSet::new() });
        if self.chain.stake(&self.id) > 0.0 {
            entry.votes.insert(self.id.clone());
        }
    }

    fn add_block(&mut self, block: Block) {
        let index = block.index;
        match self.chain.apply_block(block) {
            Ok(()) => {
                // Evict anything the new head confirmed.
                if let Some(applied) = self.chain.blocks().last().cloned() {
                    self.mempool.lock().unwrap().remove_included(&applied);
                }
                info!(
                    "chain length is now {} (excluding genesis)",
                    self.chain.height()
                );
            }
            Err(e) => error!("failed to add block {}: {}", index, e),
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Build, validate, enqueue, and broadcast a transaction of our own.
    pub fn create_transaction(
        &mut self,
        receiver: &str,
        amount: f64,
        kind: TxType,
    ) -> Result<(), TxRejected> {
        if kind == TxType::Transfer && receiver == self.id {
            warn!("attempted to send a transfer to self");
            return Err(TxRejected::SelfTransfer);
        }

        let tx = Transaction::new(&self.id, receiver, amount, kind);
        self.chain.validate_transaction(&tx)?;

        self.mempool.lock().unwrap().push(tx.clone());
        self.client.send(Message::Transaction {
            sender_id: self.id.clone(),
            tx: tx.clone(),
        });
        info!("sent {} transaction: {}", tx.kind.name(), tx);
        Ok(())
    }

    pub fn stake(&mut self, amount: f64) -> Result<(), TxRejected> {
        let id = self.id.clone();
        self.create_transaction(&id, amount, TxType::Stake)
    }

    pub fn unstake(&mut self, amount: f64) -> Result<(), TxRejected> {
        let id = self.id.clone();
        self.create_transaction(&id, amount, TxType::Unstake)
    }

    // ------------------------------------------------------------------
    // Sync protocol
    // ------------------------------------------------------------------

    pub fn request_sync(&mut self) {
        self.sync_responses.clear();
        self.sync_in_progress = true;
        self.client.send(Message::SyncRequest { sender_id: self.id.clone() });
        info!("sent SYNC_REQUEST to network");
        self.schedule(
            Duration::from_secs_f64(self.sync_cfg.timeout),
            TimerEvent::SyncTimeout,
        );
    }

    /// Runs when the sync timer fires: adopt the longest strictly-longer
    /// chain received, if any.
    fn process_sync_responses(&mut self) {
        if !self.sync_in_progress {
            return;
        }
        self.sync_in_progress = false;

        if self.sync_responses.is_empty() {
            warn!("no SYNC_RESPONSE received, sync failed");
            return;
        }

        let (best_sender, best_chain) = match self
            .sync_responses
            .iter()
            .max_by_key(|(_, blocks)| blocks.len())
        {
            Some(best) => best,
            None => return,
        };
        info!(
            "best sync candidate from {}: length {}",
            best_sender,
            best_chain.len()
        );

        // Only a strictly longer chain is worth adopting; an equal-length
        // chain is either identical or a fork we have no reason to prefer.
        if best_chain.len() <= self.chain.blocks().len() {
            info!("local chain is already the longest, nothing to adopt");
            self.sync_responses.clear();
            return;
        }

        let best_chain = best_chain.clone();
        if let Err(e) = self.chain.reorganize_to(&best_chain) {
            error!("sync reorganization failed: {}", e);
        }
        self.sync_responses.clear();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn schedule(&self, after: Duration, event: TimerEvent) {
        let tx = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
    }

    /// Persist the chain to disk.
    pub fn persist(&self) {
        if let Err(e) = storage::save_chain(&self.data_dir, &self.chain) {
            error!("failed to save chain: {:#}", e);
        }
    }

    /// Save state and ask the event loop to stop.
    pub fn shutdown(&mut self) {
        info!("shutting down node {}", self.id);
        self.persist();
        self.should_exit = true;
    }
}
