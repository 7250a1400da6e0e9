mod cli;
mod commands;
mod notifications;

use app_config::{default_config_path, ConfigStore};
use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // after parsing so `--help` does not touch the log file
    match &cli.log_dir {
        Some(dir) => app_tracing::init_tracing_to_file(dir),
        None => app_tracing::init_tracing_to_stdout(),
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    tracing::debug!("config file: {}", config_path.display());

    commands::run(cli, ConfigStore::new(config_path)).await
}
