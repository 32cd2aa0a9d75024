//! Dependent automation rules
//!
//! Rules that sign with the wallet's key and therefore stop working once the
//! wallet is disarmed.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::session::WalletKey;

/// Rule families that depend on an armed wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentKind {
    /// Take-profit / stop-loss
    TpSl,
    /// Recurring buys
    Dca,
    LimitOrder,
    ScheduledStrategy,
}

/// One automation rule as seen by the guardian
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRule {
    pub id: u64,
    pub kind: DependentKind,
    pub wallet: WalletKey,
    pub enabled: bool,
}

/// Enabled dependent rules per family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentCounts {
    pub tp_sl: u32,
    pub dca: u32,
    pub limit: u32,
    pub scheduled: u32,
}

impl DependentCounts {
    pub fn total(&self) -> u32 {
        self.tp_sl + self.dca + self.limit + self.scheduled
    }

    pub fn add(&mut self, kind: DependentKind) {
        match kind {
            DependentKind::TpSl => self.tp_sl += 1,
            DependentKind::Dca => self.dca += 1,
            DependentKind::LimitOrder => self.limit += 1,
            DependentKind::ScheduledStrategy => self.scheduled += 1,
        }
    }
}

impl std::fmt::Display for DependentCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TP/SL {}, DCA {}, limit {}, scheduled {}",
            self.tp_sl, self.dca, self.limit, self.scheduled
        )
    }
}

/// Storage for dependent rules
#[async_trait]
pub trait RulesRepository: Send + Sync {
    /// Count enabled rules per family for one wallet
    async fn count_enabled(&self, wallet: WalletKey) -> Result<DependentCounts>;

    /// Disable every enabled rule for one wallet in a single batch
    ///
    /// Returns how many rules were paused; calling it again pauses nothing.
    async fn pause_all(&self, wallet: WalletKey) -> Result<DependentCounts>;
}

/// Rules held in memory
#[derive(Default)]
pub struct MemoryRulesRepository {
    rules: RwLock<HashMap<u64, DependentRule>>,
}

impl MemoryRulesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, rule: DependentRule) {
        self.rules.write().await.insert(rule.id, rule);
    }

    pub async fn rule(&self, id: u64) -> Option<DependentRule> {
        self.rules.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl RulesRepository for MemoryRulesRepository {
    async fn count_enabled(&self, wallet: WalletKey) -> Result<DependentCounts> {
        let mut counts = DependentCounts::default();
        for rule in self.rules.read().await.values() {
            if rule.enabled && rule.wallet == wallet {
                counts.add(rule.kind);
            }
        }
        Ok(counts)
    }

    async fn pause_all(&self, wallet: WalletKey) -> Result<DependentCounts> {
        let mut paused = DependentCounts::default();
        for rule in self.rules.write().await.values_mut() {
            if rule.enabled && rule.wallet == wallet {
                rule.enabled = false;
                paused.add(rule.kind);
            }
        }

        if paused.total() > 0 {
            info!(
                user = wallet.user_id,
                wallet = wallet.wallet_id,
                paused = paused.total(),
                "Dependent rules paused"
            );
        }
        Ok(paused)
    }
}
