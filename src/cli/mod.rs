//! Command-line interface.

pub mod commands;
pub mod logging;

use clap::{Parser, Subcommand};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/tessera.toml";

/// Tessera - Raft-replicated key-value store speaking the etcd v3 API.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a member.
    Start(commands::StartArgs),
    /// Create a data directory and a sample configuration.
    Init(commands::InitArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Offline inspection of the log and snapshots.
    Inspect(commands::InspectArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tessera",
            "start",
            "--config",
            "c.toml",
            "--log-level",
            "debug",
            "--data-dir",
            "/tmp/d",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("c.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Start(args) => assert_eq!(args.data_dir.as_deref(), Some(std::path::Path::new("/tmp/d"))),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn inspect_wal_takes_a_path() {
        let cli = Cli::try_parse_from(["tessera", "inspect", "wal", "data", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect(_)));
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
