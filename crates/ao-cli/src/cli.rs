use clap::{Parser, Subcommand};

use ao_domain::config::Config;

/// Agent orchestrator core — demo wiring around the library crates.
#[derive(Debug, Parser)]
#[command(name = "ao-cli", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scripted end-to-end demo (default when no subcommand is given).
    Run,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Loads `config.toml` from the current directory (or `AO_CONFIG`), falling
/// back to defaults when no file is present.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("AO_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        Config::from_toml_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        Config::default()
    };

    Ok((config, config_path))
}
