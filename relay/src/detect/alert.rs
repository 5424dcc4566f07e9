//! Alert fan-out for detected attacks.
//!
//! Deduplicates by attack id, renders a human-readable banner to stdout,
//! and invokes registered listeners. Listeners come in two flavors:
//! synchronous callbacks and boxed-future callbacks the manager awaits.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::detect::{AttackKind, AttackPattern};

pub type AlertListener = Box<dyn Fn(&AttackPattern) + Send + Sync>;
pub type AsyncAlertListener =
    Box<dyn Fn(&AttackPattern) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct AlertManager {
    sent: HashSet<String>,
    listeners: Vec<AlertListener>,
    async_listeners: Vec<AsyncAlertListener>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: AlertListener) {
        self.listeners.push(listener);
    }

    pub fn add_async_listener(&mut self, listener: AsyncAlertListener) {
        self.async_listeners.push(listener);
    }

    /// Emit each pattern at most once, keyed by attack id.
    pub async fn send_alerts(&mut self, patterns: &[AttackPattern]) {
        for pattern in patterns {
            if !self.sent.insert(pattern.attack_id.clone()) {
                debug!("skipping duplicate alert {}", pattern.attack_id);
                continue;
            }
            self.emit(pattern).await;
        }
    }

    async fn emit(&self, pattern: &AttackPattern) {
        println!("{}", format_alert(pattern));
        warn!(
            "ATTACK DETECTED: {} - {}",
            pattern.attack_id,
            pattern.kind.name()
        );
        for listener in &self.listeners {
            listener(pattern);
        }
        for listener in &self.async_listeners {
            listener(pattern).await;
        }
    }
}

fn severity_emoji(pattern: &AttackPattern) -> &'static str {
    match pattern.severity {
        crate::detect::Severity::Low => "⚠️",
        crate::detect::Severity::Medium => "🔶",
        crate::detect::Severity::High => "🔴",
        crate::detect::Severity::Critical => "🚨",
    }
}

/// Multi-line operator-facing report.
pub fn format_alert(pattern: &AttackPattern) -> String {
    let emoji = severity_emoji(pattern);
    let bar = "=".repeat(60);
    let mut out = format!(
        "\n{bar}\n{emoji} DOUBLE SPEND ALERT {emoji}\n{bar}\n\
         Attack ID : {}\nType      : {}\nSeverity  : {}\nConfidence: {:.2}%\n\
         Details   : {}\nDetected  : {}\n",
        pattern.attack_id,
        pattern.kind.name(),
        pattern.severity.name(),
        pattern.confidence * 100.0,
        pattern.description,
        pattern.detection_time,
    );

    match pattern.kind {
        AttackKind::PotentialDoubleSpending => {
            for (i, tx) in pattern.transactions.iter().enumerate() {
                out.push_str(&format!(
                    "  tx{}: id={}... | to: {} | amount: {} | node: {}\n",
                    i + 1,
                    &tx.tx_id[..16.min(tx.tx_id.len())],
                    tx.to,
                    tx.amount,
                    tx.node,
                ));
            }
        }
        AttackKind::ForkDoubleSpending => {
            if let Some(fork) = &pattern.fork_info {
                out.push_str(&format!(
                    "  height: {}\n  block1: {} (node {})\n  block2: {} (node {})\n  conflicts: {}\n",
                    fork.height,
                    fork.block1_hash,
                    fork.block1_node,
                    fork.block2_hash,
                    fork.block2_node,
                    fork.conflicts,
                ));
            }
            // Show at most three conflicts to keep the banner readable
            for (i, c) in pattern.conflicts.iter().take(3).enumerate() {
                out.push_str(&format!(
                    "  conflict{}: {} -> {}({}) vs {}({})\n",
                    i + 1,
                    c.from,
                    c.to1,
                    c.amount1,
                    c.to2,
                    c.amount2,
                ));
            }
        }
    }

    out.push_str(&bar);
    out.push('\n');
    out
}
