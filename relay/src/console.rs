//! Operator console: newline-delimited commands on stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::server::RelayState;

const HELP: &[(&str, &str)] = &[
    ("step", "manually broadcast a STEP message"),
    ("stop", "stop sending periodic STEP messages"),
    ("continue", "resume sending periodic STEP messages"),
    ("drop", "simulate packet loss: drop <node_id> [on|off|toggle]"),
    ("delay", "simulate latency: delay <node_id> <ms|off>"),
    ("status", "show detector status"),
    ("help", "show available server commands"),
    ("exit", "shut down the server"),
];

/// Read commands until `exit` (or stdin closes) and drive the relay.
pub async fn run(state: Arc<RelayState>) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                state.shutdown();
                break;
            }
            Err(e) => {
                warn!("stdin error: {}", e);
                state.shutdown();
                break;
            }
        };

        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();

        match name {
            "step" => state.broadcast_step(),
            "stop" => state.stop_step_ticker(),
            "continue" => state.start_step_ticker(),
            "drop" => cmd_drop(&state, &args),
            "delay" => cmd_delay(&state, &args),
            "status" => cmd_status(&state),
            "help" => print_help(),
            "exit" => {
                state.shutdown();
                break;
            }
            other => {
                warn!("unknown command: {}. Type 'help' for available commands.", other);
            }
        }
    }
}

fn cmd_drop(state: &RelayState, args: &[&str]) {
    let Some(node_id) = args.first() else {
        println!("Current drop set: {:?}", state.drops());
        return;
    };
    let dropped = match args.get(1).copied().unwrap_or("toggle") {
        "on" => state.set_drop(node_id, true),
        "off" => state.set_drop(node_id, false),
        "toggle" => state.toggle_drop(node_id),
        _ => {
            println!("Usage: drop <node_id> [on|off|toggle]");
            return;
        }
    };
    info!("[DROP] {} -> {}", node_id, if dropped { "ON" } else { "OFF" });
}

fn cmd_delay(state: &RelayState, args: &[&str]) {
    let Some(node_id) = args.first() else {
        println!("Current delays (ms): {:?}", state.delays());
        return;
    };
    match args.get(1).copied() {
        None | Some("off") => {
            state.set_delay(node_id, None);
            info!("[DELAY] {} -> OFF", node_id);
        }
        Some(ms) => match ms.parse::<u64>() {
            Ok(ms) => {
                state.set_delay(node_id, Some(ms));
                info!("[DELAY] {} -> {} ms", node_id, ms);
            }
            Err(_) => println!("Usage: delay <node_id> <ms|off>"),
        },
    }
}

fn cmd_status(state: &RelayState) {
    match serde_json::to_string_pretty(&state.detector_status()) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("cannot render status: {}", e),
    }
}

fn print_help() {
    println!("Available server commands:");
    for (name, help) in HELP {
        println!("  {:<10} - {help}", name);
    }
}
