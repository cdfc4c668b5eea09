//! paqet
//!
//! Raw-socket packet proxy:
//! - `run` starts a client or server node from a YAML config
//! - `secret` prints a fresh shared key
//! - `iface` shows the detected network
//! - `example` prints a starting config for this host

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paqet::config::{Config, LogLevel, Role};
use paqet::crypto::generate_secret;
use paqet::link::datalink;
use paqet::{network, Node, Shutdown};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// paqet - KCP over forged TCP segments
#[derive(Parser, Debug)]
#[command(name = "paqet")]
#[command(about = "Raw-socket packet proxy carrying KCP sessions inside forged TCP segments")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Log level (debug, info, warn, error, fatal, none); overrides the config
        #[arg(short = 'v', long)]
        log_level: Option<LogLevel>,
    },

    /// Print a new random key for transport.kcp.key
    Secret,

    /// Show the detected interface, address and gateway
    Iface {
        /// Interface to inspect instead of the default route's
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Print an example config for this host
    Example {
        #[arg(short, long)]
        role: Role,

        #[arg(short, long)]
        interface: Option<String>,
    },
}

fn init_logging(level: LogLevel) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config, log_level } => run(config, log_level).await,
        Command::Secret => {
            println!("{}", generate_secret());
            Ok(())
        }
        Command::Iface { interface } => {
            let info = network::detect(interface.as_deref())
                .context("Failed to detect network")?;
            println!("{}", info);
            Ok(())
        }
        Command::Example { role, interface } => {
            let info = network::detect(interface.as_deref())
                .context("Failed to detect network")?;
            let config = Config::example(role, &info, generate_secret());
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

async fn run(path: PathBuf, log_level: Option<LogLevel>) -> Result<()> {
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    init_logging(log_level.unwrap_or(config.log.level));

    let link = datalink::open(&config.network.interface)
        .with_context(|| format!("Failed to open interface {}", config.network.interface))?;

    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match Node::new(config, link).run(shutdown).await {
        Ok(()) => {
            info!("Stopped");
            Ok(())
        }
        Err(e) => {
            error!("Node failed: {}", e);
            Err(e.into())
        }
    }
}

/// Raise `shutdown` on Ctrl-C or SIGTERM
async fn watch_signals(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down...");
    shutdown.trigger();
}
