//! stompd server binary.
//!
//! ```bash
//! # Listen on the defaults (::1, port 61613)
//! stompd
//!
//! # Explicit address and verbose logging
//! stompd --listen 127.0.0.1 --port 61613 --log-level debug
//! ```

use std::{
    net::IpAddr,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use stompd::{Broker, BrokerConfig};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// STOMP 1.2 message broker
#[derive(Parser, Debug)]
#[command(name = "stompd")]
#[command(about = "Single-process STOMP 1.2 message broker")]
#[command(version)]
struct Args {
    /// Listen address (IPv4 or IPv6)
    #[arg(long)]
    listen: Option<IpAddr>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = match &args.config {
        Some(path) => match BrokerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => BrokerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!(signal, error = %e, "cannot register signal handler");
            return ExitCode::FAILURE;
        }
    }

    let mut broker = match Broker::bind(config) {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = broker.run(&shutdown) {
        error!(error = %e, "broker failed");
        return ExitCode::FAILURE;
    }

    info!("goodbye");
    ExitCode::SUCCESS
}
