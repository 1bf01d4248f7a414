//! Command-line interface for saliency-gen.

use anyhow::Result;
use clap::Parser;
use saliency_gen::cli::{cmd_attribute, cmd_sweep, Cli, Command};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("saliency_gen=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Sweep(args) => cmd_sweep(args)?,
        Command::Attribute(args) => cmd_attribute(args)?,
    }

    Ok(())
}
