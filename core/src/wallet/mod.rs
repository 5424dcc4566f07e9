/// Stakenet Wallet State — per-account balances and stakes
///
/// The wallet is a plain account map. Accounts spring into existence on
/// first mutation with zero balance and zero stake. All four mutations are
/// total: they never panic and report failure through their return value,
/// which lets the chain store pre-validate a block without touching state.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

/// Per-account funds: spendable balance plus locked stake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub stake: f64,
}

/// Deep-copyable snapshot of every account. Used to seed a wallet from the
/// genesis state and to replay chains during fork validation.
pub type WalletSnapshot = BTreeMap<String, Account>;

#[derive(Debug, Clone, Default)]
pub struct Wallet {
    accounts: BTreeMap<String, Account>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a wallet pre-loaded with the given state.
    pub fn from_state(state: &WalletSnapshot) -> Self {
        Self { accounts: state.clone() }
    }

    fn get_or_create(&mut self, account_id: &str) -> &mut Account {
        self.accounts.entry(account_id.to_string()).or_default()
    }

    /// Credit `amount` to the account. Negative amounts are ignored.
    pub fn deposit(&mut self, account_id: &str, amount: f64) {
        if amount < 0.0 {
            return;
        }
        self.get_or_create(account_id).balance += amount;
    }

    /// Debit `amount` from the account. Returns `false` (and leaves the
    /// account untouched) when the balance is insufficient.
    pub fn withdraw(&mut self, account_id: &str, amount: f64) -> bool {
        let account = self.get_or_create(account_id);
        if amount > account.balance {
            return false;
        }
        account.balance -= amount;
        true
    }

    /// Move `amount` from balance to stake atomically.
    pub fn stake_tokens(&mut self, account_id: &str, amount: f64) -> bool {
        let account = self.get_or_create(account_id);
        if amount > account.balance {
            return false;
        }
        account.balance -= amount;
        account.stake += amount;
        true
    }

    /// Move `amount` from stake back to balance atomically.
    pub fn unstake_tokens(&mut self, account_id: &str, amount: f64) -> bool {
        let account = self.get_or_create(account_id);
        if amount > account.stake {
            return false;
        }
        account.stake -= amount;
        account.balance += amount;
        true
    }

    pub fn get_balance(&self, account_id: &str) -> f64 {
        self.accounts.get(account_id).map(|a| a.balance).unwrap_or(0.0)
    }

    pub fn get_stake(&self, account_id: &str) -> f64 {
        self.accounts.get(account_id).map(|a| a.stake).unwrap_or(0.0)
    }

    /// All accounts, ordered by id. Iteration order is deterministic so the
    /// validator election draws over the same candidate list on every node.
    pub fn all_accounts(&self) -> &BTreeMap<String, Account> {
        &self.accounts
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        self.accounts.clone()
    }

    pub fn restore(&mut self, snapshot: WalletSnapshot) {
        self.accounts = snapshot;
    }
}
