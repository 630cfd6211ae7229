#![warn(missing_docs)]

//! `coffer-admin` binary entry point.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coffer_admin::Cli;

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    std::process::exit(cli.run().code());
}
