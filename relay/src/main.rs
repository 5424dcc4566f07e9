use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stakenet_core::config::Config;
use stakenet_relay::{console, server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stakenet relay server", long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "stakenet.yaml")]
    config: PathBuf,

    /// Single-step mode: no periodic STEP, use the `step` command
    #[arg(long)]
    debug: bool,
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

    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;

    let state = server::RelayState::new(&config);
    info!(
        "detector armed: window {:.0}s, threshold {:.2}",
        config.detector.detection_window, config.detector.similarity_threshold
    );
    state
        .add_alert_listener(Box::new(|pattern| {
            tracing::warn!(
                "🚨 {} detected (id {}, confidence {:.0}%)",
                pattern.kind.name(),
                pattern.attack_id,
                pattern.confidence * 100.0
            );
        }))
        .await;

    if args.debug {
        info!("debug mode: STEP messages are manual (`step` command)");
    } else {
        state.start_step_ticker();
    }

    let accept = tokio::spawn(server::run(state.clone(), listener));

    console::run(state).await;

    // Console returned after shutdown; wait for the accept socket to close.
    accept.await??;
    Ok(())
}
