//! swarmlink-chat — a minimal LAN chat CLI built on `swarmlink-core`.
//!
//! # Usage
//!
//! ```bash
//! swarmlink-chat --name Alice --listen 0.0.0.0:4000
//! swarmlink-chat --name Bob --listen 0.0.0.0:4001 --seed 127.0.0.1:4000
//! ```
//!
//! Each line typed on stdin is broadcast to every connected peer; incoming
//! chat messages are printed as `<name>: <text>`.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;
use swarmlink_core::{Node, NodeConfig, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// swarmlink-chat — LAN chat demo over swarmlink-core.
#[derive(Parser, Debug)]
#[command(name = "swarmlink-chat", about = "Minimal LAN chat demo over swarmlink-core")]
struct Cli {
    /// Display name attached to every message this node sends.
    #[arg(short, long, default_value = "anon")]
    name: String,

    /// Address to accept inbound connections on (e.g. "0.0.0.0:4000").
    /// If omitted, this node only dials out.
    #[arg(short, long)]
    listen: Option<String>,

    /// Seed peer addresses to dial on startup. May be repeated.
    #[arg(short, long)]
    seed: Vec<String>,
}

const CHAT_METHOD: &str = "chat";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = NodeConfig::new().with_seeds(cli.seed.clone());
    if let Some(listen) = &cli.listen {
        config = config.with_listen_addr(listen.clone());
    }

    let node = Arc::new(Node::new(config));

    node.on_connect(|peer| {
        info!(peer = peer.id(), addr = %peer.remote_addr(), "peer connected");
    });

    node.on_disconnect(|peer| {
        info!(peer = peer.id(), addr = %peer.remote_addr(), "peer disconnected");
    });

    node.handler(CHAT_METHOD, |_peer, payload| {
        if let Some(bytes) = payload.as_bytes() {
            match std::str::from_utf8(bytes) {
                Ok(text) => println!("{text}"),
                Err(_) => warn!("received non-UTF8 chat payload"),
            }
        }
    });

    let run_node = node.clone();
    let run_handle = tokio::spawn(async move {
        if let Err(e) = run_node.run().await {
            warn!(error = %e, "node run loop exited with error");
        }
    });

    // Stdin is read on a blocking thread and forwarded over a channel; the
    // main task stays free to race it against the Ctrl+C signal.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) => {
                    if line_tx.blocking_send(text).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let display_name = cli.name.clone();
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                match line {
                    Some(text) => {
                        let message = format!("{display_name}: {text}");
                        node.broadcast(CHAT_METHOD, Value::bytes(message.into_bytes()));
                    }
                    None => break,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if ctrl_c.is_ok() {
                    info!("received Ctrl+C, shutting down");
                }
                break;
            }
        }
    }

    node.shutdown();
    run_handle.await.context("node run task panicked")?;

    Ok(())
}

/// Initializes tracing. Verbosity is controlled by `RUST_LOG`, defaulting
/// to `info`.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
