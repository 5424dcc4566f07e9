//! Interactive shell for the node daemon. Commands arrive as newline-
//! delimited stdin input; output goes straight to stdout so it stays
//! readable next to the log stream.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::blockchain::Block;
use crate::node::Node;
use crate::tx::TxType;

const HELP: &[(&str, &str)] = &[
    ("sync", "request blockchain sync from other nodes"),
    ("nodes", "get known nodes"),
    ("tx", "tx <to> <amount> - transfer tokens"),
    ("forge", "forge a new block (use --force to bypass validator check)"),
    ("stake", "stake <amount> - stake tokens to participate in block validation"),
    ("unstake", "unstake <amount> - unstake tokens"),
    ("chain", "print blockchain"),
    ("wallet", "show wallet info"),
    ("mempool", "show pending transactions"),
    ("info", "show current node info"),
    ("help", "show this help message"),
    ("exit", "save the chain and exit"),
];

impl Node {
    pub fn handle_command(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { return };
        let args: Vec<&str> = parts.collect();

        match name {
            "sync" => self.request_sync(),
            "nodes" => self.print_nodes(),
            "tx" => self.cmd_tx(&args),
            "forge" => self.forge_block(args.first() == Some(&"--force")),
            "stake" => self.cmd_stake(&args),
            "unstake" => self.cmd_unstake(&args),
            "chain" => self.print_chain(),
            "wallet" => self.print_wallet(),
            "mempool" => self.print_mempool(),
            "info" => self.print_info(),
            "help" => print_help(),
            "exit" => self.shutdown(),
            other => {
                warn!("unknown command: {}. Type 'help' for available commands.", other);
            }
        }
    }

    fn cmd_tx(&mut self, args: &[&str]) {
        let (Some(to), Some(amount)) = (args.first(), args.get(1)) else {
            println!("usage: tx <to> <amount>");
            return;
        };
        let Ok(amount) = amount.parse::<f64>() else {
            println!("usage: tx <to> <amount>");
            return;
        };
        if let Err(e) = self.create_transaction(to, amount, TxType::Transfer) {
            println!("transfer failed: {e}");
        }
    }

    fn cmd_stake(&mut self, args: &[&str]) {
        let Some(Ok(amount)) = args.first().map(|a| a.parse::<f64>()) else {
            println!("usage: stake <amount>");
            return;
        };
        if self.chain().balance(self.id()) < amount {
            println!("insufficient balance to stake");
            return;
        }
        if let Err(e) = self.stake(amount) {
            println!("stake failed: {e}");
        }
    }

    fn cmd_unstake(&mut self, args: &[&str]) {
        let Some(Ok(amount)) = args.first().map(|a| a.parse::<f64>()) else {
            println!("usage: unstake <amount>");
            return;
        };
        if self.chain().stake(self.id()) < amount {
            println!("insufficient staked balance to unstake");
            return;
        }
        if let Err(e) = self.unstake(amount) {
            println!("unstake failed: {e}");
        }
    }

    fn print_nodes(&self) {
        let mut nodes: Vec<&String> = self.known_nodes().iter().collect();
        nodes.sort();
        println!("Known nodes: {nodes:?}");
    }

    /// Render every stored block as a tree: the main chain plus any fork
    /// branches still hanging off it.
    fn print_chain(&self) {
        println!("========== Blockchain Structure ==========");
        let mut children: HashMap<&str, Vec<&Block>> = HashMap::new();
        for block in self.chain().all_blocks() {
            children.entry(block.prev_hash.as_str()).or_default().push(block);
        }
        for list in children.values_mut() {
            list.sort_by_key(|b| b.index);
        }
        let main: HashSet<&str> = self.chain().blocks().iter().map(|b| b.hash.as_str()).collect();
        let genesis = &self.chain().blocks()[0];
        print_subtree(genesis, &children, &main, "");
        println!("==========================================");
    }

    fn print_wallet(&self) {
        println!("========== Account State ==========");
        for (account, info) in self.chain().wallet_info() {
            println!(
                " Account {account} | Balance={:.2} | Stake={:.2}",
                info.balance, info.stake
            );
        }
        println!("===================================");
    }

    fn print_mempool(&self) {
        println!("========== Pending Transactions ==========");
        for tx in self.mempool_txs() {
            println!("  {tx}");
        }
        println!("==========================================");
    }

    fn print_info(&self) {
        println!("Node ID: {}", self.id());
        self.print_nodes();
        self.print_chain();
        self.print_wallet();
        self.print_mempool();
    }
}

fn print_subtree(
    block: &Block,
    children: &HashMap<&str, Vec<&Block>>,
    main: &HashSet<&str>,
    prefix: &str,
) {
    let marker = if main.contains(block.hash.as_str()) { "(main)" } else { "(fork)" };
    println!(
        "{prefix}Block {} | hash={}... | validator={} | tx_count={} {marker}",
        block.index,
        block.short_hash(),
        block.validator,
        block.transactions.len()
    );
    if let Some(kids) = children.get(block.hash.as_str()) {
        for (i, child) in kids.iter().enumerate() {
            let connector = if i + 1 == kids.len() { "└── " } else { "├── " };
            let next_prefix = format!("{prefix}{connector}");
            print_subtree(child, children, main, &next_prefix);
        }
    }
}

fn print_help() {
    println!("Available commands:");
    for (name, help) in HELP {
        println!("  {:<10} - {help}", name);
    }
}
