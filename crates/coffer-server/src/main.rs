#![warn(missing_docs)]

//! `coffer-server` binary entry point.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coffer_server::{Daemon, ServerConfig};

/// Coffer backup store daemon.
#[derive(Debug, Parser)]
#[command(name = "coffer-server", version, about)]
struct Args {
    /// Path to the configuration file (TOML or JSON).
    #[arg(short, long, default_value = "/etc/coffer/coffer.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        tracing::warn!(
            "config file not found, using defaults: {}",
            args.config.display()
        );
        ServerConfig::default()
    };

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}
