// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! groupcastd: the broker's CLI entry point.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port, default state directory
//! groupcastd
//!
//! # Custom port and state directory
//! groupcastd --port 9000 --state-dir /var/lib/groupcast
//!
//! # Load settings from a config file (flags still override it)
//! groupcastd --config groupcast.json
//! ```

use clap::Parser;
use groupcast::{BrokerConfig, Reactor};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// groupcastd - group-membership and fan-out broadcast broker
#[derive(Parser, Debug)]
#[command(name = "groupcastd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding each group's backing file and the reset marker
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Cold-start reset window in seconds
    #[arg(long)]
    reset_window_secs: Option<u64>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if let Some(path) = &args.config {
        info!(path = %path.display(), "loading config");
        BrokerConfig::from_file(path)?
    } else {
        BrokerConfig::default()
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(secs) = args.reset_window_secs {
        config.reset_window_secs = secs;
    }

    info!("+----------------------------------------------------+");
    info!(
        "|       groupcast broker v{}                      |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Port:      {:40} |", config.port);
    info!("|  State dir: {:40} |", config.state_dir.display());
    info!("|  Reset:     {:40} |", format!("{}s", config.reset_window_secs));
    info!("+----------------------------------------------------+");

    let mut reactor = Reactor::new(&config)?;
    let running = reactor.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("received Ctrl+C, shutting down...");
        running.store(false, std::sync::atomic::Ordering::Relaxed);
    })?;

    reactor.run()?;
    info!("groupcast broker stopped");
    Ok(())
}
