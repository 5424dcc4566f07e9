use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use stakenet_core::config::Config;
use stakenet_core::net::{NetEvent, RelayClient};
use stakenet_core::node::Node;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stakenet PoS node daemon", long_about = None)]
struct Args {
    /// Node ID (e.g., node1, node2, ...)
    #[arg(long)]
    node: String,

    /// Path to the YAML config file
    #[arg(long, default_value = "stakenet.yaml")]
    config: PathBuf,

    /// Data directory; defaults to ./data_node_<id>
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(format!("data_node_{}", args.node)));

    println!("Starting Stakenet node [{}]", args.node);
    println!("Relay: {}", config.server.addr());
    println!("Data dir: {}", data_dir.display());

    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let client = RelayClient::connect(&args.node, &config.server.addr(), net_tx).await?;

    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let mut node = Node::new(&args.node, &config, data_dir, client, timer_tx);
    node.start();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = net_rx.recv() => match event {
                Some(NetEvent::Message(msg)) => node.handle_message(msg),
                Some(NetEvent::Disconnected) | None => {
                    warn!("lost connection to relay, exiting");
                    node.shutdown();
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => node.handle_command(&line),
                Ok(None) => node.shutdown(),
                Err(e) => {
                    warn!("stdin error: {}", e);
                    node.shutdown();
                }
            },
            timer = timer_rx.recv() => {
                if let Some(event) = timer {
                    node.handle_timer(event);
                }
            }
        }

        if node.should_exit() {
            break;
        }
    }

    Ok(())
}
