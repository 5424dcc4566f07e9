//! On-line double-spend detection.
//!
//! The detector watches the TRANSACTION and BLOCK frames passing through
//! the relay. Transactions are compared against a sliding per-sender
//! history with a similarity score; blocks are compared against competing
//! blocks at the same height for conflicting spends. Self-transfers are
//! STAKE/UNSTAKE operations and are excluded everywhere.

pub mod alert;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use stakenet_core::blockchain::Block;
use stakenet_core::config::DetectorConfig;
use stakenet_core::tx::{unix_now, Transaction};

/// Two transactions with equal recipient and amount inside this many
/// seconds are treated as one retransmission, not two spends.
const NEAR_DUPLICATE_WINDOW: f64 = 2.0;

/// Amount tolerance for fork conflicts: 20% of the larger amount.
const FORK_AMOUNT_TOLERANCE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackKind {
    PotentialDoubleSpending,
    ForkDoubleSpending,
}

impl AttackKind {
    pub fn name(&self) -> &'static str {
        match self {
            AttackKind::PotentialDoubleSpending => "POTENTIAL_DOUBLE_SPENDING",
            AttackKind::ForkDoubleSpending => "FORK_DOUBLE_SPENDING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Severity::High
        } else if score >= 0.6 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// One of the two transactions behind an alert.
#[derive(Debug, Clone, Serialize)]
pub struct TxInvolved {
    pub tx_id: String,
    pub to: String,
    pub amount: f64,
    pub node: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkInfo {
    pub height: u64,
    pub conflicts: usize,
    pub block1_node: String,
    pub block2_node: String,
    pub block1_hash: String,
    pub block2_hash: String,
}

/// A pair of transactions spending the same funds on both sides of a fork.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub from: String,
    pub to1: String,
    pub to2: String,
    pub amount1: f64,
    pub amount2: f64,
    pub tx1_id: String,
    pub tx2_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttackPattern {
    pub attack_id: String,
    #[serde(rename = "type")]
    pub kind: AttackKind,
    pub confidence: f64,
    pub severity: Severity,
    pub description: String,
    pub detection_time: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxInvolved>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_info: Option<ForkInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
}

/// Introspection snapshot for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionStatus {
    pub detection_window: f64,
    pub similarity_threshold: f64,
    pub monitored_nodes: usize,
    pub total_attacks_detected: usize,
    pub processed_tx_count: usize,
    pub detected_pairs_count: usize,
    pub recent_transactions: BTreeMap<String, usize>,
    pub transactions_by_sender: BTreeMap<String, usize>,
    pub recent_blocks: BTreeMap<String, usize>,
}

/// A transaction as the detector saw it. `observed_at` is relay wall-clock
/// time, not the transaction's own timestamp.
#[derive(Debug, Clone)]
struct ObservedTx {
    observed_at: f64,
    node_id: String,
    from: String,
    to: String,
    amount: f64,
    tx_id: String,
}

#[derive(Debug, Clone)]
struct ObservedBlock {
    observed_at: f64,
    node_id: String,
    height: u64,
    hash: String,
    transactions: Vec<ObservedTx>,
}

pub struct DoubleSpendDetector {
    detection_window: f64,
    similarity_threshold: f64,
    node_transactions: HashMap<String, Vec<ObservedTx>>,
    txs_by_sender: HashMap<String, Vec<ObservedTx>>,
    recent_blocks: HashMap<String, Vec<ObservedBlock>>,
    processed_tx_ids: HashSet<String>,
    detected_pairs: HashSet<(String, String)>,
    attacks: Vec<AttackPattern>,
}

impl DoubleSpendDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            detection_window: config.detection_window,
            similarity_threshold: config.similarity_threshold,
            node_transactions: HashMap::new(),
            txs_by_sender: HashMap::new(),
            recent_blocks: HashMap::new(),
            processed_tx_ids: HashSet::new(),
            detected_pairs: HashSet::new(),
            attacks: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Transaction intake
    // ------------------------------------------------------------------

    pub fn observe_transaction(&mut self, node_id: &str, tx: &Transaction) -> Vec<AttackPattern> {
        self.observe_transaction_at(node_id, tx, unix_now())
    }

    /// Intake with an explicit observation time. The relay always passes
    /// the wall clock; tests drive the window directly.
    pub fn observe_transaction_at(
        &mut self,
        node_id: &str,
        tx: &Transaction,
        now: f64,
    ) -> Vec<AttackPattern> {
        if tx.sender.is_empty() || tx.receiver.is_empty() || tx.amount <= 0.0 {
            debug!("ignoring malformed transaction from {}", node_id);
            return Vec::new();
        }

        // STAKE/UNSTAKE are self-transfers and can never be double-spends.
        if tx.sender == tx.receiver {
            debug!("skipping self-transfer from {}", tx.sender);
            return Vec::new();
        }

        let tx_id = format!(
            "tx_{}_{}_{}_{:.6}",
            tx.sender, tx.receiver, tx.amount, now
        );
        let observed = ObservedTx {
            observed_at: now,
            node_id: node_id.to_string(),
            from: tx.sender.clone(),
            to: tx.receiver.clone(),
            amount: tx.amount,
            tx_id,
        };

        if self.is_near_duplicate(&observed) {
            debug!("near-duplicate transaction from {}, suppressed", observed.from);
            return Vec::new();
        }

        if !self.processed_tx_ids.insert(observed.tx_id.clone()) {
            return Vec::new();
        }

        let patterns = self.check_against_history(&observed);

        self.node_transactions
            .entry(observed.node_id.clone())
            .or_default()
            .push(observed.clone());
        self.txs_by_sender
            .entry(observed.from.clone())
            .or_default()
            .push(observed);
        self.cleanup(now);

        patterns
    }

    /// Same recipient and amount within two seconds is a retransmission.
    fn is_near_duplicate(&self, new_tx: &ObservedTx) -> bool {
        self.txs_by_sender
            .get(&new_tx.from)
            .map(|history| {
                history.iter().any(|tx| {
                    tx.to == new_tx.to
                        && tx.amount == new_tx.amount
                        && (new_tx.observed_at - tx.observed_at).abs() < NEAR_DUPLICATE_WINDOW
                })
            })
            .unwrap_or(false)
    }

    /// Compare the new transaction against the sender's deduplicated
    /// recent history; emit at most one pattern, for the first match.
    fn check_against_history(&mut self, new_tx: &ObservedTx) -> Vec<AttackPattern> {
        let candidates = self.unique_history(new_tx);
        debug!(
            "checking {} against {} historical transaction(s)",
            new_tx.tx_id,
            candidates.len()
        );

        for candidate in candidates {
            let pair = ordered_pair(&new_tx.tx_id, &candidate.tx_id);
            if self.detected_pairs.contains(&pair) {
                continue;
            }

            let score = similarity(new_tx, &candidate);
            debug!(
                "similarity {:.3} (threshold {:.3})",
                score, self.similarity_threshold
            );
            if score < self.similarity_threshold {
                continue;
            }

            self.detected_pairs.insert(pair);
            warn!(
                "double spend suspected: {} -> {}({}) vs {}({})",
                new_tx.from, new_tx.to, new_tx.amount, candidate.to, candidate.amount
            );

            let pattern = AttackPattern {
                attack_id: format!(
                    "ds_{}_{:03}",
                    Utc::now().format("%Y%m%d_%H%M%S"),
                    self.attacks.len()
                ),
                kind: AttackKind::PotentialDoubleSpending,
                confidence: score,
                severity: Severity::from_score(score),
                description: format!(
                    "{} sent similar amounts ({} vs {}) to different recipients ({} vs {})",
                    new_tx.from, new_tx.amount, candidate.amount, new_tx.to, candidate.to
                ),
                detection_time: Utc::now().to_rfc3339(),
                transactions: vec![
                    TxInvolved {
                        tx_id: new_tx.tx_id.clone(),
                        to: new_tx.to.clone(),
                        amount: new_tx.amount,
                        node: new_tx.node_id.clone(),
                    },
                    TxInvolved {
                        tx_id: candidate.tx_id.clone(),
                        to: candidate.to.clone(),
                        amount: candidate.amount,
                        node: candidate.node_id.clone(),
                    },
                ],
                fork_info: None,
                conflicts: Vec::new(),
            };
            self.attacks.push(pattern.clone());
            // First match only; the pair set blocks repeats.
            return vec![pattern];
        }
        Vec::new()
    }

    /// The sender's in-window history, minus the current transaction,
    /// deduplicated by (recipient, amount, whole second). Self-transfers
    /// never enter the windows, so they need no re-filtering here.
    fn unique_history(&self, current: &ObservedTx) -> Vec<ObservedTx> {
        let Some(history) = self.txs_by_sender.get(&current.from) else {
            return Vec::new();
        };

        let mut seen: HashSet<(String, u64, i64)> = HashSet::new();
        let mut unique = Vec::new();
        for tx in history {
            if tx.tx_id == current.tx_id {
                continue;
            }
            if (current.observed_at - tx.observed_at).abs() > self.detection_window {
                continue;
            }
            let signature = (
                tx.to.clone(),
                tx.amount.to_bits(),
                tx.observed_at.floor() as i64,
            );
            if seen.insert(signature) {
                unique.push(tx.clone());
            }
        }
        unique
    }

    // ------------------------------------------------------------------
    // Block intake
    // ------------------------------------------------------------------

    pub fn observe_block(&mut self, node_id: &str, block: &Block) -> Vec<AttackPattern> {
        self.observe_block_at(node_id, block, unix_now())
    }

    pub fn observe_block_at(
        &mut self,
        node_id: &str,
        block: &Block,
        now: f64,
    ) -> Vec<AttackPattern> {
        let observed = ObservedBlock {
            observed_at: now,
            node_id: node_id.to_string(),
            height: block.index,
            hash: block.hash.clone(),
            transactions: block
                .transactions
                .iter()
                .map(|tx| ObservedTx {
                    observed_at: now,
                    node_id: node_id.to_string(),
                    from: tx.sender.clone(),
                    to: tx.receiver.clone(),
                    amount: tx.amount,
                    tx_id: tx.tx_id(),
                })
                .collect(),
        };
        info!(
            "observing block height={} from {} with {} transaction(s)",
            observed.height,
            node_id,
            observed.transactions.len()
        );

        let patterns = self.check_fork_conflicts(&observed);

        self.recent_blocks
            .entry(node_id.to_string())
            .or_default()
            .push(observed);
        self.cleanup(now);

        patterns
    }

    /// Scan stored blocks for competitors at the same height and report
    /// conflicting spends between the two transaction sets.
    fn check_fork_conflicts(&mut self, new_block: &ObservedBlock) -> Vec<AttackPattern> {
        if new_block.hash.is_empty() {
            return Vec::new();
        }

        let competitors: Vec<&ObservedBlock> = self
            .recent_blocks
            .values()
            .flatten()
            .filter(|b| {
                b.height == new_block.height
                    && b.hash != new_block.hash
                    && b.node_id != new_block.node_id
            })
            .collect();

        let mut patterns = Vec::new();
        for competitor in competitors {
            let conflicts = find_conflicts(&new_block.transactions, &competitor.transactions);
            if conflicts.is_empty() {
                continue;
            }
            warn!(
                "fork double spend: {} conflict(s) at height {} between {} and {}",
                conflicts.len(),
                new_block.height,
                new_block.node_id,
                competitor.node_id
            );
            patterns.push(AttackPattern {
                attack_id: format!(
                    "fork_{}_{}",
                    Utc::now().format("%Y%m%d_%H%M%S"),
                    self.attacks.len() + patterns.len()
                ),
                kind: AttackKind::ForkDoubleSpending,
                confidence: 0.95,
                severity: Severity::Critical,
                description: format!(
                    "conflicting transactions at height {}",
                    new_block.height
                ),
                detection_time: Utc::now().to_rfc3339(),
                transactions: Vec::new(),
                fork_info: Some(ForkInfo {
                    height: new_block.height,
                    conflicts: conflicts.len(),
                    block1_node: new_block.node_id.clone(),
                    block2_node: competitor.node_id.clone(),
                    block1_hash: truncated(&new_block.hash),
                    block2_hash: truncated(&competitor.hash),
                }),
                conflicts,
            });
        }
        self.attacks.extend(patterns.iter().cloned());
        patterns
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Trim every window to the detection horizon and expire processed tx
    /// ids by the timestamp embedded in them.
    fn cleanup(&mut self, now: f64) {
        let cutoff = now - self.detection_window;

        self.node_transactions.retain(|_, txs| {
            txs.retain(|tx| tx.observed_at > cutoff);
            !txs.is_empty()
        });
        self.txs_by_sender.retain(|_, txs| {
            txs.retain(|tx| tx.observed_at > cutoff);
            !txs.is_empty()
        });
        self.recent_blocks.retain(|_, blocks| {
            blocks.retain(|b| b.observed_at > cutoff);
            !blocks.is_empty()
        });

        // Ids carry their observation time as the final "_" segment; an id
        // that does not parse is kept.
        self.processed_tx_ids.retain(|id| {
            id.rsplit('_')
                .next()
                .and_then(|ts| ts.parse::<f64>().ok())
                .map(|ts| ts >= cutoff)
                .unwrap_or(true)
        });
    }

    // ------------------------------------------------------------------
    // Introspection and control
    // ------------------------------------------------------------------

    pub fn status(&self) -> DetectionStatus {
        DetectionStatus {
            detection_window: self.detection_window,
            similarity_threshold: self.similarity_threshold,
            monitored_nodes: self.node_transactions.len(),
            total_attacks_detected: self.attacks.len(),
            processed_tx_count: self.processed_tx_ids.len(),
            detected_pairs_count: self.detected_pairs.len(),
            recent_transactions: self
                .node_transactions
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            transactions_by_sender: self
                .txs_by_sender
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            recent_blocks: self
                .recent_blocks
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        }
    }

    pub fn attack_history(&self) -> Vec<AttackPattern> {
        self.attacks.clone()
    }

    /// Update the similarity threshold; rejects values outside [0,1].
    pub fn set_threshold(&mut self, threshold: f64) -> bool {
        if (0.0..=1.0).contains(&threshold) {
            info!(
                "similarity threshold changed from {} to {}",
                self.similarity_threshold, threshold
            );
            self.similarity_threshold = threshold;
            true
        } else {
            false
        }
    }

    pub fn clear_attacks(&mut self) {
        self.attacks.clear();
        self.detected_pairs.clear();
    }

    pub fn reset(&mut self) {
        self.node_transactions.clear();
        self.txs_by_sender.clear();
        self.recent_blocks.clear();
        self.processed_tx_ids.clear();
        self.detected_pairs.clear();
        self.attacks.clear();
        info!("detector state reset");
    }
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn truncated(hash: &str) -> String {
    format!("{}...", &hash[..16.min(hash.len())])
}

/// Similarity of two observed transactions, in [0,1].
///
/// Same sender is the necessary condition and is worth 0.5. Different
/// recipients (the double-spend signature) add 0.2, identical recipients
/// only 0.1. Identical amounts add 0.3; amounts within 10% add a linearly
/// decaying share of 0.3. Any self-transfer scores 0.
fn similarity(tx1: &ObservedTx, tx2: &ObservedTx) -> f64 {
    if tx1.from == tx1.to || tx2.from == tx2.to {
        return 0.0;
    }
    if tx1.from != tx2.from || tx1.from.is_empty() {
        return 0.0;
    }

    let mut score = 0.5;

    if tx1.to != tx2.to && !tx1.to.is_empty() && !tx2.to.is_empty() {
        score += 0.2;
    } else if tx1.to == tx2.to {
        score += 0.1;
    }

    if tx1.amount > 0.0 && tx2.amount > 0.0 {
        if tx1.amount == tx2.amount {
            score += 0.3;
        } else {
            let diff = (tx1.amount - tx2.amount).abs() / tx1.amount.max(tx2.amount);
            if diff <= 0.1 {
                score += 0.3 * (1.0 - diff / 0.1);
            }
        }
    }

    score.min(1.0)
}

/// Conflicting spends between two blocks: same sender, different
/// recipients, amounts within 20% of the larger. Self-transfers (stakes)
/// are skipped on both sides.
fn find_conflicts(txs1: &[ObservedTx], txs2: &[ObservedTx]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for tx1 in txs1 {
        for tx2 in txs2 {
            if tx1.from == tx1.to || tx2.from == tx2.to {
                continue;
            }
            if tx1.from != tx2.from || tx1.from.is_empty() {
                continue;
            }
            if tx1.to == tx2.to || tx1.to.is_empty() || tx2.to.is_empty() {
                continue;
            }
            if (tx1.amount - tx2.amount).abs()
                <= tx1.amount.max(tx2.amount) * FORK_AMOUNT_TOLERANCE
            {
                conflicts.push(Conflict {
                    from: tx1.from.clone(),
                    to1: tx1.to.clone(),
                    to2: tx2.to.clone(),
                    amount1: tx1.amount,
                    amount2: tx2.amount,
                    tx1_id: tx1.tx_id.clone(),
                    tx2_id: tx2.tx_id.clone(),
                });
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakenet_core::tx::TxType;

    fn detector(window: f64, threshold: f64) -> DoubleSpendDetector {
        DoubleSpendDetector::new(&DetectorConfig {
            detection_window: window,
            similarity_threshold: threshold,
        })
    }

    fn transfer(from: &str, to: &str, amount: f64) -> Transaction {
        Transaction::with_timestamp(from, to, amount, 0.0, TxType::Transfer)
    }

    #[test]
    fn test_classic_double_spend_scores_one() {
        // Same sender, different recipients, identical amounts:
        // 0.5 + 0.2 + 0.3 = 1.0, severity HIGH.
        let mut d = detector(60.0, 0.5);
        assert!(d
            .observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0)
            .is_empty());
        let patterns =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 100.0), 1010.0);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.kind, AttackKind::PotentialDoubleSpending);
        assert_eq!(p.confidence, 1.0);
        assert_eq!(p.severity, Severity::High);
        assert_eq!(p.transactions.len(), 2);
    }

    #[test]
    fn test_self_transfers_never_alert() {
        let mut d = detector(60.0, 0.1);
        assert!(d
            .observe_transaction_at("node1", &transfer("v1", "v1", 20.0), 1000.0)
            .is_empty());
        assert!(d
            .observe_transaction_at("node1", &transfer("v1", "v1", 20.0), 1010.0)
            .is_empty());
        // and they never appear as history either
        assert!(d
            .observe_transaction_at("node1", &transfer("v1", "x", 20.0), 1020.0)
            .is_empty());
        assert_eq!(d.attack_history().len(), 0);
    }

    #[test]
    fn test_near_duplicate_suppressed() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 50.0), 1000.0);
        // Identical recipient and amount inside 2 s: a retransmission.
        let patterns =
            d.observe_transaction_at("node2", &transfer("alice", "bob", 50.0), 1001.0);
        assert!(patterns.is_empty());
        assert_eq!(d.status().processed_tx_count, 1);
    }

    #[test]
    fn test_pair_reported_once() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        let first =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 100.0), 1010.0);
        assert_eq!(first.len(), 1);
        // A third spend matches the first history entry: a new pair, but the
        // (tx2, tx3) pair with the same shape reports once at most.
        let second =
            d.observe_transaction_at("node1", &transfer("alice", "dave", 100.0), 1020.0);
        assert_eq!(second.len(), 1);
        let total = d.attack_history().len();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_similar_but_not_equal_amounts() {
        // 5% apart: 0.5 + 0.2 + 0.3*(1-0.05/0.1) = 0.85
        let mut d = detector(60.0, 0.8);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        let patterns =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 95.0), 1010.0);
        assert_eq!(patterns.len(), 1);
        let c = patterns[0].confidence;
        assert!((c - 0.85).abs() < 1e-9, "confidence {c}");
        assert_eq!(patterns[0].severity, Severity::High);
    }

    #[test]
    fn test_amounts_far_apart_do_not_alert() {
        let mut d = detector(60.0, 0.8);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        // 0.5 + 0.2 + 0 = 0.7 < 0.8
        let patterns =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 50.0), 1010.0);
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_outside_window_ignored() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        let patterns =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 100.0), 1100.0);
        assert!(patterns.is_empty(), "history beyond the window must not match");
    }

    #[test]
    fn test_windows_trimmed() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        d.observe_transaction_at("node1", &transfer("dave", "erin", 5.0), 1100.0);
        let status = d.status();
        assert_eq!(status.transactions_by_sender.get("alice"), None);
        assert_eq!(status.transactions_by_sender.get("dave"), Some(&1));
        assert_eq!(status.processed_tx_count, 1);
    }

    #[test]
    fn test_severity_boundaries() {
        assert_eq!(Severity::from_score(0.95), Severity::High);
        assert_eq!(Severity::from_score(0.8), Severity::High);
        assert_eq!(Severity::from_score(0.7), Severity::Medium);
        assert_eq!(Severity::from_score(0.6), Severity::Medium);
        assert_eq!(Severity::from_score(0.59), Severity::Low);
    }

    #[test]
    fn test_fork_conflict_detected() {
        let mut d = detector(60.0, 0.8);
        let genesis_hash = "g".repeat(64);

        let b1 = Block::with_timestamp(
            5,
            genesis_hash.clone(),
            "node1",
            vec![transfer("alice", "bob", 100.0)],
            1000.0,
        );
        let b2 = Block::with_timestamp(
            5,
            genesis_hash,
            "node2",
            vec![transfer("alice", "charlie", 95.0)],
            1001.0,
        );

        assert!(d.observe_block_at("node1", &b1, 1000.0).is_empty());
        let patterns = d.observe_block_at("node2", &b2, 1001.0);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.kind, AttackKind::ForkDoubleSpending);
        assert_eq!(p.severity, Severity::Critical);
        assert_eq!(p.confidence, 0.95);
        let fork = p.fork_info.as_ref().unwrap();
        assert_eq!(fork.height, 5);
        assert_eq!(fork.conflicts, 1);
        assert_eq!(p.conflicts[0].from, "alice");
    }

    #[test]
    fn test_fork_skips_stake_transactions() {
        let mut d = detector(60.0, 0.8);
        let parent = "p".repeat(64);
        let b1 = Block::with_timestamp(
            3,
            parent.clone(),
            "node1",
            vec![transfer("v1", "v1", 50.0)],
            1000.0,
        );
        let b2 = Block::with_timestamp(
            3,
            parent,
            "node2",
            vec![transfer("v1", "v1", 50.0)],
            1001.0,
        );
        d.observe_block_at("node1", &b1, 1000.0);
        assert!(d.observe_block_at("node2", &b2, 1001.0).is_empty());
    }

    #[test]
    fn test_fork_amount_tolerance() {
        let mut d = detector(60.0, 0.8);
        let parent = "p".repeat(64);
        let b1 = Block::with_timestamp(
            3,
            parent.clone(),
            "node1",
            vec![transfer("alice", "bob", 100.0)],
            1000.0,
        );
        // 75 vs 100 is 25% apart: outside the 20% tolerance.
        let b2 = Block::with_timestamp(
            3,
            parent,
            "node2",
            vec![transfer("alice", "charlie", 75.0)],
            1001.0,
        );
        d.observe_block_at("node1", &b1, 1000.0);
        assert!(d.observe_block_at("node2", &b2, 1001.0).is_empty());
    }

    #[test]
    fn test_set_threshold_validated() {
        let mut d = detector(60.0, 0.8);
        assert!(d.set_threshold(0.5));
        assert!(!d.set_threshold(1.5));
        assert!(!d.set_threshold(-0.1));
        assert_eq!(d.status().similarity_threshold, 0.5);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        d.observe_transaction_at("node1", &transfer("alice", "charlie", 100.0), 1010.0);
        assert!(!d.attack_history().is_empty());
        d.reset();
        let status = d.status();
        assert_eq!(status.total_attacks_detected, 0);
        assert_eq!(status.processed_tx_count, 0);
        assert_eq!(status.monitored_nodes, 0);
    }

    #[test]
    fn test_pattern_serializes() {
        let mut d = detector(60.0, 0.5);
        d.observe_transaction_at("node1", &transfer("alice", "bob", 100.0), 1000.0);
        let patterns =
            d.observe_transaction_at("node1", &transfer("alice", "charlie", 100.0), 1010.0);
        let json = serde_json::to_value(&patterns[0]).unwrap();
        assert_eq!(json["type"], "POTENTIAL_DOUBLE_SPENDING");
        assert_eq!(json["severity"], "HIGH");
        assert!(json["attack_id"].as_str().unwrap().starts_with("ds_"));
    }
}
