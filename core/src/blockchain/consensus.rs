//! Validator election.
//!
//! Every node runs the same election on every STEP. Determinism comes from
//! two ingredients: the RNG is seeded from SHA-256 of the head block hash,
//! and the candidate list is drawn from the wallet's ordered account map.
//! Honest nodes on the same chain with the same known-validator set always
//! elect the same validator.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::blockchain::chain::Chain;

/// Pick the validator for the next block.
///
/// First pass takes every known validator with positive stake, weighted by
/// stake. If nobody has stake, a second pass weights by balance instead.
/// Returns `None` when no candidate has stake or balance.
pub fn select_validator(chain: &Chain, known_validators: &HashSet<String>) -> Option<String> {
    let accounts = chain.wallet_info();

    let mut candidates: Vec<(&str, f64)> = accounts
        .iter()
        .filter(|(id, _)| known_validators.contains(id.as_str()))
        .filter(|(_, acct)| acct.stake > 0.0)
        .map(|(id, acct)| (id.as_str(), acct.stake))
        .collect();

    if candidates.is_empty() {
        warn!("no validators with stake > 0, falling back to balance-weighted selection");
        candidates = accounts
            .iter()
            .filter(|(id, _)| known_validators.contains(id.as_str()))
            .filter(|(_, acct)| acct.balance > 0.0)
            .map(|(id, acct)| (id.as_str(), acct.balance))
            .collect();
    }

    if candidates.is_empty() {
        warn!("no validators available at all (stake=0 and balance=0)");
        return None;
    }

    // Seed from the head hash so every node draws the same winner.
    let seed: [u8; 32] = Sha256::digest(chain.head().hash.as_bytes()).into();
    let mut rng = ChaCha20Rng::from_seed(seed);

    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    let mut draw = rng.gen_range(0.0..total);
    for (id, weight) in &candidates {
        if draw < *weight {
            debug!("selected validator {} (weight {} of {})", id, weight, total);
            return Some(id.to_string());
        }
        draw -= weight;
    }
    // Floating-point edge: the draw landed exactly on the upper bound.
    candidates.last().map(|(id, _)| id.to_string())
}
