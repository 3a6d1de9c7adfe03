//! Tether CLI: operator entry point for the episode runtime.
//!
//! Commands:
//! - `config`      Show or validate configuration
//! - `estop`       Engage or release the emergency stop
//! - `checkpoint`  Inspect stored episode checkpoints

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tether_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "tether",
    about = "Tether: bounded agent episode runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.tether/config.toml
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Emergency stop: cancel every running episode at its next tool call
    Estop {
        /// Release a previously engaged stop
        #[arg(long)]
        resume: bool,

        /// Reason recorded with the stop
        #[arg(long, default_value = "operator emergency stop")]
        reason: String,
    },

    /// Inspect episode checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate a config file (defaults to the active one)
    Validate { path: Option<PathBuf> },
    /// Print the config file path
    Path,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, optionally for one episode
    List { episode_id: Option<String> },
    /// Print one checkpoint and verify its digest
    Show { id: String },
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig, tether_config::ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}

fn init_tracing(verbose: bool, config: Option<&AppConfig>) {
    let level = match (verbose, config) {
        (true, _) => "debug".to_string(),
        (false, Some(c)) => c.logging.level.clone(),
        (false, None) => "info".to_string(),
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.is_some_and(|c| c.logging.json) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref());
    init_tracing(cli.verbose, config.as_ref().ok());
    if let Err(e) = &config {
        tracing::warn!(error = %e, "Configuration failed to load");
    }

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config?).await?,
            ConfigAction::Validate { path } => {
                let path = path.or(cli.config).unwrap_or_else(commands::config_cmd::default_path);
                commands::config_cmd::validate(&path).await?
            }
            ConfigAction::Path => commands::config_cmd::path(cli.config.as_deref()).await?,
        },
        Commands::Estop { resume, reason } => commands::estop::run(&config?, resume, reason).await?,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::List { episode_id } => {
                commands::checkpoint::list(&config?, episode_id).await?
            }
            CheckpointAction::Show { id } => commands::checkpoint::show(&config?, &id).await?,
        },
    }

    Ok(())
}
