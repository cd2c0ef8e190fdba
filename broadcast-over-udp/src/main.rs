//! Entry point for `broadcast-over-udp`.
//!
//! Loads the hosts and broadcast config files, starts one process of the
//! group, and writes the broadcast/delivery log when the process is told to
//! stop.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, signal handling, argument parsing).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use broadcast_over_udp::config::{BroadcastConfig, LinkConfig, PeerDirectory};
use broadcast_over_udp::node::{Mode, Node};
use broadcast_over_udp::simulator::SimulatorConfig;

/// Uniform reliable FIFO / causal broadcast over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Id of this process in the hosts file.
    #[arg(long)]
    id: u32,

    /// Hosts file: one "<id> <host> <port>" line per process.
    #[arg(long)]
    hosts: PathBuf,

    /// Where to write the broadcast/delivery log on shutdown.
    #[arg(long)]
    output: PathBuf,

    /// Broadcast config: message count, then influence lines.
    #[arg(long)]
    config: PathBuf,

    /// Ordering layer to run above uniform reliable broadcast.
    #[arg(long, value_enum, default_value_t = ModeArg::Fifo)]
    mode: ModeArg,

    /// Congestion window size at start and after a timeout.
    #[arg(long)]
    base_window: Option<u64>,

    /// Initial slow-start threshold.
    #[arg(long)]
    threshold: Option<u64>,

    /// Synthetic outbound datagram loss rate, for experiments.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Seed for the synthetic loss model.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Fifo,
    Causal,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let directory = PeerDirectory::load(&cli.hosts)
        .with_context(|| format!("loading hosts file {}", cli.hosts.display()))?;
    let broadcast = BroadcastConfig::load(&cli.config, cli.id)
        .with_context(|| format!("loading config file {}", cli.config.display()))?;
    let book = directory.resolve().await;

    let faults = (cli.loss > 0.0).then(|| SimulatorConfig::lossy(cli.loss, cli.seed));
    let socket = Node::bind(&book, cli.id, faults)
        .await
        .context("binding process socket")?;
    log::info!("[node] process {} listening on {}", cli.id, socket.local_addr);

    let mut link_config = LinkConfig::default();
    if let Some(base) = cli.base_window {
        link_config.base_window = base;
    }
    if let Some(threshold) = cli.threshold {
        link_config.initial_threshold = threshold;
    }

    let mode = match cli.mode {
        ModeArg::Fifo => Mode::Fifo,
        ModeArg::Causal => Mode::causal_from(&broadcast),
    };

    let (node, finished) = Node::start(
        socket,
        book,
        cli.id,
        link_config,
        broadcast.messages,
        mode,
    );
    let Node {
        mut deliveries,
        log: delivery_log,
        link,
        ..
    } = node;

    tokio::spawn(async move {
        if let Ok(count) = finished.await {
            log::info!("[node] all {count} messages submitted for broadcast");
        }
    });

    tokio::spawn(async move {
        let mut delivered = 0u64;
        while deliveries.recv().await.is_some() {
            delivered += 1;
            if delivered % 100 == 0 {
                log::info!("[node] delivered {delivered} messages");
            }
        }
    });

    shutdown_signal().await;

    log::info!("[node] stopping; link stats {:?}", link.stats());
    delivery_log
        .write_to(&cli.output)
        .with_context(|| format!("writing output {}", cli.output.display()))?;
    log::info!(
        "[node] wrote {} events to {}",
        delivery_log.len(),
        cli.output.display()
    );
    Ok(())
}

/// Resolve on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[node] cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("[node] cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
