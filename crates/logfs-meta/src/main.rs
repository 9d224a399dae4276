#![warn(missing_docs)]
//! LogFS image maintenance tool

use anyhow::Result;
use clap::Parser;
use logfs_meta::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    Cli::parse().run()
}
