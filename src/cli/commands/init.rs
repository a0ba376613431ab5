//! Init command implementation.

use crate::core::config::Config;
use crate::raft::types::NodeId;
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Create a data directory and a sample configuration.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Data directory.
    #[arg(short, long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Member id written into the sample config.
    #[arg(long, default_value_t = 1)]
    pub id: NodeId,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

/// Run the init command, writing the config to `config_path`.
pub fn run_init(config_path: &Path, args: InitArgs) -> Result<()> {
    for sub in ["wal", "snap"] {
        let dir = args.data_dir.join(sub);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    println!("Initialized data directory: {}", args.data_dir.display());

    if config_path.exists() && !args.force {
        println!(
            "Config {} already exists; pass --force to overwrite",
            config_path.display()
        );
        return Ok(());
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let config = Config::single_member(args.id, args.data_dir);
    std::fs::write(config_path, config.to_toml()?)
        .with_context(|| format!("writing {}", config_path.display()))?;
    println!("Wrote sample config: {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_config_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config_path = dir.path().join("conf/tessera.toml");
        run_init(
            &config_path,
            InitArgs {
                data_dir: data_dir.clone(),
                id: 7,
                force: false,
            },
        )
        .unwrap();

        assert!(data_dir.join("wal").is_dir());
        assert!(data_dir.join("snap").is_dir());
        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.member.id, 7);
        config.validate().unwrap();
    }

    #[test]
    fn keeps_existing_config_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tessera.toml");
        std::fs::write(&config_path, "# mine\n").unwrap();
        run_init(
            &config_path,
            InitArgs {
                data_dir: dir.path().join("data"),
                id: 1,
                force: false,
            },
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "# mine\n");
    }
}
