//! Alice CLI entry point.
//!
//! Loads `.env` and the config file, initializes tracing, and dispatches the
//! subcommand. `alice bot` runs the Telegram gateway; the rest are operator
//! tools that work directly on the database.

mod admin;
mod bot;
mod cli;
mod commands;
mod config;
mod helpers;
mod messages;
mod telegram;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, warn};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::helpers::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;

    // Operator commands print their own output; keep the log quiet.
    let level = match cli.command {
        Commands::Bot { .. } => config.alice.log_level.as_str(),
        _ => "warn",
    };
    init_tracing(level, config.alice.log_format);

    match dotenv {
        Ok(path) => debug!(path = %path.display(), ".env loaded"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to read .env"),
    }
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Bot { poll_timeout } => bot::cmd_bot(config, poll_timeout).await,
        Commands::Migrate => admin::cmd_migrate(&config).await,
        Commands::Replenish { force } => admin::cmd_replenish(&config, force).await,
        Commands::Credit { owner, amount } => admin::cmd_credit(&config, owner, amount).await,
        Commands::Payment { action } => admin::cmd_payment(&config, action).await,
        Commands::Promo { action } => admin::cmd_promo(&config, action).await,
        Commands::Status => admin::cmd_status(&config, &cli.config).await,
    }
}
