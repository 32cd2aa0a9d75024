//! CLI command implementations

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditLog, JsonlAuditStore};
use crate::config::Config;
use crate::wallet::JsonWalletDirectory;
use crate::sweep::{
    rpc_client, validate_destination, FreeBalanceCalculator, Reservations, RpcBalanceProvider,
    RpcTransferProvider, SweepAsset, SweepExecutor, SweepPolicy, WalletBalances,
};

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// List wallet records in the registry
pub async fn wallet_list(config: &Config) -> Result<()> {
    let directory = JsonWalletDirectory::load(Path::new(&config.storage.wallets_path))?;
    let wallets = directory.list().await;

    println!("\n=== WALLETS ===\n");
    if wallets.is_empty() {
        println!("No wallets registered.");
        return Ok(());
    }

    println!(
        "{:<8} {:<8} {:<46} {:<8} {:<12} {}",
        "USER", "WALLET", "ADDRESS", "ARMING", "AUTO-RETURN", "KEY"
    );
    println!("{}", "-".repeat(100));

    for w in &wallets {
        let auto_return = match (w.auto_return.enabled, &w.auto_return.destination) {
            (true, Some(_)) => "on",
            (true, None) => "no dest",
            (false, _) => "off",
        };
        println!(
            "{:<8} {:<8} {:<46} {:<8} {:<12} {}",
            w.user_id,
            w.wallet_id,
            w.address,
            if w.requires_arming { "yes" } else { "no" },
            auto_return,
            if w.encrypted_key.is_some() { "sealed" } else { "-" }
        );
    }

    println!("\nTotal: {} wallets", wallets.len());
    Ok(())
}

fn open_audit_log(config: &Config) -> AuditLog {
    if config.audit.hmac_secret.is_empty() {
        warn!("audit.hmac_secret is empty; verification uses an empty key");
    }
    AuditLog::new(
        Arc::new(JsonlAuditStore::new(&config.audit.path)),
        config.audit.hmac_secret.as_bytes(),
    )
}

/// Recompute a user's audit chain
pub async fn audit_verify(config: &Config, user_id: u64) -> Result<()> {
    let log = open_audit_log(config);
    let report = log
        .verify(user_id)
        .await
        .with_context(|| format!("Failed to read audit log {}", config.audit.path))?;

    println!("\n=== AUDIT CHAIN: USER {} ===\n", user_id);
    println!("Entries: {}", report.entries);

    match report.broken {
        None => {
            println!("Chain intact.");
            Ok(())
        }
        Some(brk) => {
            println!("BROKEN at row {} (id {}): {}", brk.index, brk.entry_id, brk.reason);
            anyhow::bail!("audit chain for user {} failed verification", user_id)
        }
    }
}

/// Print the most recent audit rows of a user
pub async fn audit_log(config: &Config, user_id: u64, limit: usize) -> Result<()> {
    let log = open_audit_log(config);
    let entries = log
        .entries(user_id)
        .await
        .with_context(|| format!("Failed to read audit log {}", config.audit.path))?;

    println!("\n=== AUDIT LOG: USER {} ===\n", user_id);
    if entries.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }

    println!("{:<22} {:<12} {:<18} {}", "TIME", "EVENT", "HASH", "META");
    println!("{}", "-".repeat(90));

    let skip = entries.len().saturating_sub(limit);
    for entry in entries.iter().skip(skip) {
        println!(
            "{:<22} {:<12} {:<18} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.event,
            short_hash(&entry.hash),
            entry.meta_json
        );
    }

    println!();
    Ok(())
}

/// Dry-run a sweep of `address`: read live balances and print the transfer plan
pub async fn sweep_plan(config: &Config, address: &str, destination: Option<&str>) -> Result<()> {
    let owner = Pubkey::from_str(address).with_context(|| format!("Invalid address: {}", address))?;
    if let Some(destination) = destination {
        validate_destination(destination, &owner)?;
    }

    let client = rpc_client(&config.rpc);
    let provider = Arc::new(RpcBalanceProvider::new(client.clone()));
    let balances = WalletBalances::fetch(provider.as_ref(), &owner)
        .await
        .context("Failed to read balances")?;
    info!(owner = %owner, tokens = balances.tokens.len(), "Balances loaded");

    // Reservations live with the automation service; a dry run nets nothing.
    let calculator = FreeBalanceCalculator::new(config.sweep.fee_buffer_lamports);
    let snapshot = calculator.compute(&balances, &Reservations::default());

    let executor = SweepExecutor::new(
        SweepPolicy::from_config(&config.sweep)?,
        Arc::new(RpcTransferProvider::new(client)),
        provider,
    );
    let plan = executor.plan(&snapshot);

    println!("\n=== SWEEP PLAN: {} ===\n", owner);
    println!(
        "Native: {:.9} SOL on-chain, {:.9} SOL free",
        lamports_to_sol(balances.native),
        lamports_to_sol(snapshot.native_amount)
    );
    if !snapshot.wrapped_native.is_empty() {
        println!("Wrapped SOL accounts to close: {}", snapshot.wrapped_native.len());
    }
    println!();

    if plan.is_empty() {
        println!("Nothing to sweep.");
        return Ok(());
    }

    println!("{:<4} {:<46} {}", "#", "ASSET", "AMOUNT");
    println!("{}", "-".repeat(70));
    for (i, planned) in plan.iter().enumerate() {
        let amount = match &planned.asset {
            SweepAsset::Native => format!("{:.9} SOL", lamports_to_sol(planned.amount)),
            SweepAsset::Token { decimals, .. } => {
                format_token_amount(planned.amount, *decimals)
            }
        };
        println!("{:<4} {:<46} {}", i + 1, planned.asset.to_string(), amount);
    }

    println!();
    Ok(())
}

/// First 12 characters of a stored hash; rows may hold anything
fn short_hash(hash: &str) -> String {
    format!("{}...", hash.chars().take(12).collect::<String>())
}

/// Convert lamports to SOL
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / 1_000_000_000.0
}

fn format_token_amount(amount: u64, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u64.pow(u32::from(decimals.min(19)));
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals.min(19) as usize
    )
}
