//! CLI argument definitions for Alice.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Alice -- a credit-metered companion bot for Telegram.
#[derive(Parser)]
#[command(
    name = "alice",
    version,
    about = "Alice -- credit-metered Telegram companion bot",
    long_about = "Runs the Alice Telegram gateway and the operator tools around it: \
                  migrations, credit grants, payment confirmation, promo codes, and status."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Telegram bot gateway.
    Bot {
        /// Telegram long-polling timeout in seconds (overrides the config).
        #[arg(long)]
        poll_timeout: Option<u64>,
    },

    /// Create or upgrade the database schema.
    Migrate,

    /// Top up every balance below the floor.
    Replenish {
        /// Run even if today's sweep was already applied.
        #[arg(long)]
        force: bool,
    },

    /// Grant credits to one account.
    Credit {
        /// Telegram chat id.
        owner: i64,
        /// Credits to add (positive).
        amount: i64,
    },

    /// Record and settle payments.
    Payment {
        #[command(subcommand)]
        action: PaymentAction,
    },

    /// Manage promo codes.
    Promo {
        #[command(subcommand)]
        action: PromoAction,
    },

    /// Show database, ledger, and configuration status.
    Status,
}

#[derive(Subcommand)]
pub enum PaymentAction {
    /// Record a pending order.
    Record {
        order_id: String,
        owner: i64,
        /// Credits granted on confirmation.
        units: i64,
    },
    /// Mark an order paid and credit its owner (once).
    Confirm { order_id: String },
    /// Mark an order failed.
    Fail { order_id: String },
    /// List the latest orders of one account.
    List {
        owner: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub enum PromoAction {
    /// Create a new code.
    Create {
        code: String,
        /// Credits granted per redemption.
        reward: i64,
        /// Total redemptions allowed (unlimited when omitted).
        #[arg(long)]
        max_uses: Option<i64>,
        /// Expire the code this many days from now.
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Stop accepting a code.
    Deactivate { code: String },
    /// Show one code.
    Show { code: String },
}
