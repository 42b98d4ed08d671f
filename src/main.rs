use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::ConfigManager;
use crate::logger::{init_logger, log_system_information};
use crate::program::Program;

mod archive;
mod cli;
mod config;
mod logger;
mod program;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let config = config_manager.get_app_config()?;

    let log_dir = PathBuf::from(&config.paths.log_directory);
    let _logger = init_logger(&log_dir, &config.logging).context("Failed to initialize logger")?;
    log_system_information();
    if config_manager.created_default() {
        warn!(
            "Config file not found, created defaults at {}",
            config_manager.config_path().display()
        );
    }
    info!("Using config {}", config_manager.config_path().display());

    let program = Program::new(config);
    let result = program.run(cli.command).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
