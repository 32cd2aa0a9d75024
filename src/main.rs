//! armguard - operator CLI for armed hot-wallet sessions
//!
//! Inspects configuration, verifies the audit chain, and dry-runs sweeps
//! against live balances. Arming itself happens in the request-handling
//! service that embeds the library.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use armguard::cli::commands;
use armguard::config::Config;

/// Time-boxed hot-wallet arming with pre-expiry fund return
#[derive(Parser)]
#[command(name = "armguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "armguard.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration (secrets masked)
    Config,

    /// List registered wallets
    Wallets,

    /// Audit trail commands
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Sweep commands
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Recompute every hash of a user's chain
    Verify {
        #[arg(long)]
        user: u64,
    },

    /// Show recent audit rows
    Log {
        #[arg(long)]
        user: u64,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SweepAction {
    /// Print the transfer plan for a wallet without sending anything
    Plan {
        /// Hot wallet address
        #[arg(long)]
        address: String,

        /// Cold destination to validate against the wallet
        #[arg(long)]
        destination: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("armguard=info".parse()?),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Config => commands::show_config(&config),
        Commands::Wallets => commands::wallet_list(&config).await,
        Commands::Audit { action } => match action {
            AuditAction::Verify { user } => commands::audit_verify(&config, user).await,
            AuditAction::Log { user, limit } => commands::audit_log(&config, user, limit).await,
        },
        Commands::Sweep { action } => match action {
            SweepAction::Plan {
                address,
                destination,
            } => commands::sweep_plan(&config, &address, destination.as_deref()).await,
        },
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
