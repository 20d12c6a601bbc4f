mod cli;
mod config_cmd;
mod demo;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ao_domain::config::{Config, ConfigSeverity, LogFormat};
use cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        None | Some(Command::Run) => {
            let (config, _config_path) = cli::load_config()?;
            init_tracing(&config);
            run_demo(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !config_cmd::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            config_cmd::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("ao-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.observability.log_level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.observability.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

async fn run_demo(config: Config) -> anyhow::Result<()> {
    tracing::info!("agent orchestrator core demo starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if Config::has_errors(&issues) {
        anyhow::bail!("refusing to start with an invalid configuration");
    }

    demo::run(&config).await?;

    tracing::info!("agent orchestrator core demo finished");
    Ok(())
}
