//! Ordered multi-asset sweep
//!
//! Transfer order:
//! 1. every token that is neither excluded nor a designated stablecoin, in snapshot order
//! 2. designated stablecoins
//! 3. native SOL above the minimum-keep threshold
//!
//! Each transfer stands alone; a failed asset is logged and the sweep moves on.
//! The session is re-checked before every signature: once the wallet is
//! disarmed the sweep stops and reports what it sent so far.
//!
//! The native leg is sized last from a fresh balance read, so lamports spent
//! on token legs (fees, destination ATA rent) come out of the swept amount
//! instead of the floor left behind.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::error::{Error, Result};

use super::balance::{BalanceProvider, FreeBalanceSnapshot};

/// One sweepable asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SweepAsset {
    Native,
    Token {
        mint: Pubkey,
        decimals: u8,
        source_account: Pubkey,
    },
}

impl SweepAsset {
    /// Mint of a token asset, `None` for native SOL
    pub fn mint(&self) -> Option<Pubkey> {
        match self {
            SweepAsset::Native => None,
            SweepAsset::Token { mint, .. } => Some(*mint),
        }
    }
}

impl std::fmt::Display for SweepAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepAsset::Native => f.write_str("SOL"),
            SweepAsset::Token { mint, .. } => write!(f, "{}", mint),
        }
    }
}

/// Signs and sends asset transfers
#[async_trait]
pub trait TransferProvider: Send + Sync {
    /// Move `amount` base units of `asset` from the signer to `destination`
    async fn transfer(
        &self,
        signer: &Keypair,
        destination: &Pubkey,
        asset: &SweepAsset,
        amount: u64,
    ) -> Result<Signature>;

    /// Close a wrapped SOL account into the signer's system account
    async fn unwrap_native(&self, signer: &Keypair, account: &Pubkey) -> Result<Signature>;
}

/// Which assets are swept and how much SOL stays behind
#[derive(Debug, Clone, Default)]
pub struct SweepPolicy {
    pub min_keep_lamports: u64,
    pub stable_mints: HashSet<Pubkey>,
    pub excluded_mints: HashSet<Pubkey>,
}

impl SweepPolicy {
    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        Ok(Self {
            min_keep_lamports: config.min_keep_lamports,
            stable_mints: parse_mints(&config.stable_mints)?,
            excluded_mints: parse_mints(&config.excluded_mints)?,
        })
    }
}

fn parse_mints(mints: &[String]) -> Result<HashSet<Pubkey>> {
    mints
        .iter()
        .map(|m| {
            Pubkey::from_str(m).map_err(|e| Error::Config(format!("Invalid mint {}: {}", m, e)))
        })
        .collect()
}

/// Parse a sweep destination and refuse the source wallet itself
pub fn validate_destination(destination: &str, source: &Pubkey) -> Result<Pubkey> {
    let parsed = Pubkey::from_str(destination.trim()).map_err(|e| {
        Error::InvalidDestination(format!("{}: {}", destination, e))
    })?;
    if parsed == *source {
        return Err(Error::InvalidDestination(format!(
            "{} is the source wallet",
            destination
        )));
    }
    Ok(parsed)
}

/// One transfer the sweep will attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTransfer {
    pub asset: SweepAsset,
    pub amount: u64,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Signatures of successful transfers, in order
    pub txids: Vec<Signature>,
    pub failures: Vec<(SweepAsset, String)>,
    /// The session ended before every planned transfer was signed
    pub halted: bool,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }
}

/// Turns a free-balance snapshot into ordered transfers
pub struct SweepExecutor {
    policy: SweepPolicy,
    transfers: Arc<dyn TransferProvider>,
    balances: Arc<dyn BalanceProvider>,
}

impl SweepExecutor {
    pub fn new(
        policy: SweepPolicy,
        transfers: Arc<dyn TransferProvider>,
        balances: Arc<dyn BalanceProvider>,
    ) -> Self {
        Self {
            policy,
            transfers,
            balances,
        }
    }

    pub fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    /// Ordered transfers for a snapshot; amounts never exceed the free amount
    pub fn plan(&self, snapshot: &FreeBalanceSnapshot) -> Vec<PlannedTransfer> {
        let mut others = Vec::new();
        let mut stables = Vec::new();

        for asset in &snapshot.assets {
            if asset.amount == 0 || self.policy.excluded_mints.contains(&asset.mint) {
                continue;
            }
            let planned = PlannedTransfer {
                asset: SweepAsset::Token {
                    mint: asset.mint,
                    decimals: asset.decimals,
                    source_account: asset.source_account,
                },
                amount: asset.amount,
            };
            if self.policy.stable_mints.contains(&asset.mint) {
                stables.push(planned);
            } else {
                others.push(planned);
            }
        }

        let mut plan = others;
        plan.append(&mut stables);

        let native = snapshot
            .native_amount
            .saturating_sub(self.policy.min_keep_lamports);
        if native > 0 {
            plan.push(PlannedTransfer {
                asset: SweepAsset::Native,
                amount: native,
            });
        }

        plan
    }

    /// Execute the plan for `snapshot`, signing with the wallet's key
    ///
    /// `is_armed` is consulted before every signature; the sweep halts as soon
    /// as it returns false.
    pub async fn execute(
        &self,
        signer: &Keypair,
        snapshot: &FreeBalanceSnapshot,
        destination: &Pubkey,
        is_armed: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<SweepReport> {
        let source = signer.pubkey();
        if *destination == source {
            return Err(Error::InvalidDestination(format!(
                "{} is the source wallet",
                destination
            )));
        }

        let plan = self.plan(snapshot);
        let mut report = SweepReport::default();
        debug!(source = %source, transfers = plan.len(), "Sweep planned");

        for planned in plan {
            if !is_armed() {
                warn!(source = %source, sent = report.txids.len(), "Sweep halted: session ended");
                report.halted = true;
                break;
            }

            let mut amount = planned.amount;

            if planned.asset == SweepAsset::Native {
                let (unwrapped, unspendable) = self.unwrap_native(signer, snapshot, is_armed).await;
                if !is_armed() {
                    warn!(source = %source, sent = report.txids.len(), "Sweep halted: session ended");
                    report.halted = true;
                    break;
                }
                amount = amount.saturating_sub(unspendable);

                // Lamports that left the wallet since the snapshot (token leg
                // fees and ATA rent) are taken out of this leg.
                let expected = snapshot.observed_native.saturating_add(unwrapped);
                match self.balances.native_balance(&source).await {
                    Ok(live) => {
                        let spent = expected.saturating_sub(live);
                        if spent > 0 {
                            debug!(spent, "Native leg reduced by spend since snapshot");
                        }
                        amount = amount.saturating_sub(spent);
                    }
                    Err(e) => {
                        let failure = Error::TransferFailure {
                            asset: planned.asset.to_string(),
                            reason: format!("balance re-read failed: {}", e),
                        };
                        warn!("{}", failure);
                        report.failures.push((planned.asset, e.to_string()));
                        continue;
                    }
                }
                if amount == 0 {
                    continue;
                }
                if !is_armed() {
                    warn!(source = %source, sent = report.txids.len(), "Sweep halted: session ended");
                    report.halted = true;
                    break;
                }
            }

            match self
                .transfers
                .transfer(signer, destination, &planned.asset, amount)
                .await
            {
                Ok(signature) => {
                    info!(
                        asset = %planned.asset,
                        amount,
                        destination = %destination,
                        sig = %signature,
                        "Swept"
                    );
                    report.txids.push(signature);
                }
                Err(e) => {
                    let failure = Error::TransferFailure {
                        asset: planned.asset.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(amount, "{}", failure);
                    report.failures.push((planned.asset, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Close wrapped SOL accounts; returns (unwrapped, still wrapped) lamports
    async fn unwrap_native(
        &self,
        signer: &Keypair,
        snapshot: &FreeBalanceSnapshot,
        is_armed: &(dyn Fn() -> bool + Send + Sync),
    ) -> (u64, u64) {
        let mut unwrapped = 0u64;
        let mut unspendable = 0u64;
        for wrapped in &snapshot.wrapped_native {
            if !is_armed() {
                unspendable = unspendable.saturating_add(wrapped.amount);
                continue;
            }
            match self.transfers.unwrap_native(signer, &wrapped.account).await {
                Ok(signature) => {
                    debug!(account = %wrapped.account, sig = %signature, "Unwrapped SOL");
                    unwrapped = unwrapped.saturating_add(wrapped.amount);
                }
                Err(e) => {
                    warn!(account = %wrapped.account, error = %e, "Unwrap failed");
                    unspendable = unspendable.saturating_add(wrapped.amount);
                }
            }
        }
        (unwrapped, unspendable)
    }
}
