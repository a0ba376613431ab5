//! Start command implementation.

use crate::cli::logging::init_tracing;
use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Run a member.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override `member.data_dir`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Load the config, apply overrides and run until shutdown.
pub async fn run_start(config_path: &Path, log_level: Option<&str>, args: StartArgs) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.apply_overrides(&ConfigOverrides {
        log_level: log_level.map(str::to_string),
        data_dir: args.data_dir,
    });
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
