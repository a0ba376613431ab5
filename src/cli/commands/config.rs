//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Toml,
    Json,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load and validate the configuration file.
    Validate,
    /// Print the configuration with defaults filled in.
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

/// Run the config command against the file at `config_path`.
pub fn run_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    match args.command {
        ConfigCommand::Validate => {
            config.validate()?;
            println!("{}", summary(&config));
            Ok(())
        }
        ConfigCommand::Show { format } => {
            println!("{}", render(&config, format)?);
            Ok(())
        }
    }
}

fn summary(config: &Config) -> String {
    let mut out = format!(
        "✓ configuration is valid\n  member: {:x} ({})\n  data_dir: {}\n  client: {}  peer: {}",
        config.member.id,
        config.member.name,
        config.member.data_dir.display(),
        config.listeners.client_bind,
        config.listeners.peer_bind,
    );
    let members = config.initial_members();
    out.push_str(&format!("\n  initial members: {}", members.len()));
    for m in &members {
        out.push_str(&format!("\n    {:x} {} {}", m.id, m.name, m.peer_addr));
    }
    if config.listeners.tls_chain_path.is_none() {
        out.push_str("\n  ⚠ client listener has no TLS");
    }
    out
}

fn render(config: &Config, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Toml => config.to_toml(),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(config)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_and_toml_render_the_same_config() {
        let config = Config::single_member(3, "/tmp/tessera");
        let json: serde_json::Value = serde_json::from_str(&render(&config, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["member"]["id"], 3);

        let toml = render(&config, OutputFormat::Toml).unwrap();
        let back = Config::from_toml(&toml).unwrap();
        assert_eq!(back.member.id, 3);
    }

    #[test]
    fn summary_lists_members() {
        let config = Config::single_member(1, "/tmp/tessera");
        let text = summary(&config);
        assert!(text.contains("initial members: 1"));
        assert!(text.contains("no TLS"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let args = ConfigArgs {
            command: ConfigCommand::Validate,
        };
        assert!(run_config(Path::new("/nonexistent/tessera.toml"), args).is_err());
    }
}
