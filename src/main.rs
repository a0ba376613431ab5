//! Tessera command-line entrypoint.
//!
//! Usage:
//!   tessera start --config config/tessera.toml
//!   tessera init --data-dir data --id 1
//!   tessera config validate --config config/tessera.toml
//!   tessera config show --format json
//!   tessera inspect wal data/
//!   tessera inspect snapshot data/ --json

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tessera::cli::commands::{run_config, run_init, run_inspect, run_start};
use tessera::cli::{Cli, Commands, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, cli.log_level.as_deref(), args).await,
        Commands::Init(args) => run_init(&config_path, args),
        Commands::Config(args) => run_config(&config_path, args),
        Commands::Inspect(args) => run_inspect(args),
    }
}
