//! Free balance computation
//!
//! Live on-chain balances are netted against what in-flight automation has
//! already earmarked. Only the remainder may be swept.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::session::WalletKey;

/// One SPL token account held by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBalance {
    pub mint: Pubkey,
    /// Token account holding the balance
    pub account: Pubkey,
    /// Raw amount in base units
    pub amount: u64,
    pub decimals: u8,
}

/// Read-only on-chain balance source
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Lamports held by the wallet's system account
    async fn native_balance(&self, owner: &Pubkey) -> Result<u64>;

    /// Every token account owned by the wallet, wrapped SOL included
    async fn token_balances(&self, owner: &Pubkey) -> Result<Vec<TokenBalance>>;
}

/// Balances read at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletBalances {
    pub native: u64,
    pub tokens: Vec<TokenBalance>,
}

impl WalletBalances {
    pub async fn fetch(provider: &dyn BalanceProvider, owner: &Pubkey) -> Result<Self> {
        let native = provider.native_balance(owner).await?;
        let tokens = provider.token_balances(owner).await?;
        Ok(Self { native, tokens })
    }
}

/// Amounts earmarked by in-flight automation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservations {
    /// Lamports, wrapped SOL included
    pub native: u64,
    pub tokens: HashMap<Pubkey, u64>,
}

impl Reservations {
    pub fn token(&self, mint: &Pubkey) -> u64 {
        self.tokens.get(mint).copied().unwrap_or(0)
    }
}

/// Index of in-flight reservations
#[async_trait]
pub trait ReservationSource: Send + Sync {
    async fn reservations(&self, wallet: WalletKey) -> Result<Reservations>;
}

/// Reservations held in memory; `None` as mint means native SOL
#[derive(Default)]
pub struct MemoryReservations {
    inner: RwLock<HashMap<WalletKey, Reservations>>,
}

impl MemoryReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reserve(&self, wallet: WalletKey, mint: Option<Pubkey>, amount: u64) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(wallet).or_default();
        match mint {
            None => entry.native = entry.native.saturating_add(amount),
            Some(mint) => {
                let reserved = entry.tokens.entry(mint).or_insert(0);
                *reserved = reserved.saturating_add(amount);
            }
        }
    }

    pub async fn release(&self, wallet: WalletKey, mint: Option<Pubkey>, amount: u64) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.get_mut(&wallet) else {
            return;
        };
        match mint {
            None => entry.native = entry.native.saturating_sub(amount),
            Some(mint) => {
                if let Some(reserved) = entry.tokens.get_mut(&mint) {
                    *reserved = reserved.saturating_sub(amount);
                    if *reserved == 0 {
                        entry.tokens.remove(&mint);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ReservationSource for MemoryReservations {
    async fn reservations(&self, wallet: WalletKey) -> Result<Reservations> {
        Ok(self.inner.read().await.get(&wallet).cloned().unwrap_or_default())
    }
}

/// Sweepable amount of one token account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreeAsset {
    pub mint: Pubkey,
    pub amount: u64,
    pub decimals: u8,
    pub source_account: Pubkey,
}

/// Wrapped SOL account folded into the native total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WrappedNative {
    pub account: Pubkey,
    pub amount: u64,
}

/// What may be swept right now
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreeBalanceSnapshot {
    /// Free lamports, wrapped SOL included
    pub native_amount: u64,
    /// System account lamports as read, before netting
    pub observed_native: u64,
    pub assets: Vec<FreeAsset>,
    /// Wrapped SOL accounts that must be closed before the native amount is spendable
    pub wrapped_native: Vec<WrappedNative>,
}

impl FreeBalanceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.native_amount == 0 && self.assets.is_empty()
    }
}

/// Nets balances against reservations
#[derive(Debug, Clone, Copy)]
pub struct FreeBalanceCalculator {
    /// Lamports held back from the native balance for fees
    pub fee_buffer: u64,
}

impl FreeBalanceCalculator {
    pub fn new(fee_buffer: u64) -> Self {
        Self { fee_buffer }
    }

    pub fn compute(&self, balances: &WalletBalances, reservations: &Reservations) -> FreeBalanceSnapshot {
        let native_mint = spl_token::native_mint::id();

        let mut native_total = balances.native;
        let mut wrapped_native = Vec::new();
        let mut assets = Vec::new();
        let mut remaining_reserved: HashMap<Pubkey, u64> = reservations.tokens.clone();

        for token in &balances.tokens {
            if token.mint == native_mint {
                native_total = native_total.saturating_add(token.amount);
                if token.amount > 0 {
                    wrapped_native.push(WrappedNative {
                        account: token.account,
                        amount: token.amount,
                    });
                }
                continue;
            }

            // A mint's reservation is drawn down across its accounts in order.
            let reserved = remaining_reserved.entry(token.mint).or_insert(0);
            let held_back = token.amount.min(*reserved);
            *reserved -= held_back;

            let free = token.amount - held_back;
            if free > 0 {
                assets.push(FreeAsset {
                    mint: token.mint,
                    amount: free,
                    decimals: token.decimals,
                    source_account: token.account,
                });
            }
        }

        let native_amount = native_total
            .saturating_sub(reservations.native)
            .saturating_sub(self.fee_buffer);

        FreeBalanceSnapshot {
            native_amount,
            observed_native: balances.native,
            assets,
            wrapped_native,
        }
    }
}
