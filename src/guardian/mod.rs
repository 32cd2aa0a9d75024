//! Session guardian
//!
//! Entry point for arm/extend/disarm. For every armed wallet the guardian
//! keeps two timers and drives the auto-return schedule from the same expiry:
//!
//! ```text
//! arm/extend ──► SessionKeyCache ──► expires_at
//!                                      ├─ warn   at max(now, expires_at − warn_lead)
//!                                      ├─ expire at expires_at
//!                                      └─ AutoReturnScheduler at expires_at − preempt
//! ```
//!
//! Expiry and user disarm share one path: cancel timers, wipe the key, count
//! (and optionally pause) dependent rules, audit, notify. Notifications are
//! sent in the background and never fail or delay the operation.

pub mod notify;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::GuardianConfig;
use crate::error::{Error, Result};
use crate::session::{ArmStatus, SessionKeyCache, WalletKey};
use crate::sweep::{AutoReturnOverrides, AutoReturnScheduler};
use crate::timer::TimerSlots;
use crate::wallet::WalletDirectory;

pub use notify::{
    BroadcastNotifier, FanoutNotifier, GuardianEvent, NoopNotifier, Notification, Notifier,
};
pub use rules::{DependentCounts, DependentKind, DependentRule, MemoryRulesRepository, RulesRepository};

/// Reason recorded when a session times out
pub const EXPIRED_REASON: &str = "expired";

/// What an expiry or disarm found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisarmOutcome {
    /// A live session existed
    pub was_armed: bool,
    pub dependents: DependentCounts,
    /// Dependent rules were paused
    pub paused: bool,
}

/// Pending timers for one wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimers {
    pub warn_at: Option<Instant>,
    pub expire_at: Option<Instant>,
    pub auto_return_at: Option<Instant>,
}

/// Orchestrates arming, expiry timers and dependent-rule notification
#[derive(Clone)]
pub struct Guardian {
    config: Arc<GuardianConfig>,
    cache: Arc<SessionKeyCache>,
    wallets: Arc<dyn WalletDirectory>,
    rules: Arc<dyn RulesRepository>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<AuditLog>,
    auto_return: AutoReturnScheduler,
    warn_timers: Arc<TimerSlots<WalletKey>>,
    expire_timers: Arc<TimerSlots<WalletKey>>,
}

impl Guardian {
    pub fn new(
        config: GuardianConfig,
        cache: Arc<SessionKeyCache>,
        wallets: Arc<dyn WalletDirectory>,
        rules: Arc<dyn RulesRepository>,
        audit: Arc<AuditLog>,
        auto_return: AutoReturnScheduler,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            wallets,
            rules,
            notifier: Arc::new(NoopNotifier),
            audit,
            auto_return,
            warn_timers: Arc::new(TimerSlots::new("warn")),
            expire_timers: Arc::new(TimerSlots::new("expire")),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn cache(&self) -> &Arc<SessionKeyCache> {
        &self.cache
    }

    pub fn auto_return(&self) -> &AutoReturnScheduler {
        &self.auto_return
    }

    /// Arm a wallet with its DEK
    ///
    /// `ttl` is clamped into the configured bounds; `None` uses the default.
    /// Overrides replace the wallet's stored auto-return defaults until disarm;
    /// `None` goes back to the stored defaults. Only `extend` keeps overrides.
    pub async fn arm(
        &self,
        wallet: WalletKey,
        dek: Vec<u8>,
        ttl: Option<Duration>,
        overrides: Option<AutoReturnOverrides>,
    ) -> Result<ArmStatus> {
        if dek.is_empty() {
            return Err(Error::InvalidKeypair("empty DEK".to_string()));
        }

        let ttl = self.config.effective_ttl(ttl);
        let expires_at = self.cache.arm(wallet, dek, ttl);
        let status = self.cache.status(wallet);
        self.reschedule(wallet, expires_at, Some(overrides.unwrap_or_default()));

        self.audit
            .event(
                wallet.user_id,
                AuditEvent::Arm,
                json!({
                    "wallet_id": wallet.wallet_id,
                    "ttl_ms": ttl.as_millis() as u64,
                }),
            )
            .await;

        Ok(status)
    }

    /// Push expiry of a live session to now + `ttl`
    ///
    /// Returns `false`, scheduling nothing, when the wallet is not armed.
    pub async fn extend(&self, wallet: WalletKey, ttl: Option<Duration>) -> bool {
        let ttl = self.config.effective_ttl(ttl);
        let Some(expires_at) = self.cache.extend(wallet, ttl) else {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Extend ignored: not armed");
            return false;
        };
        self.reschedule(wallet, expires_at, None);

        self.audit
            .event(
                wallet.user_id,
                AuditEvent::Extend,
                json!({
                    "wallet_id": wallet.wallet_id,
                    "ttl_ms": ttl.as_millis() as u64,
                }),
            )
            .await;

        true
    }

    /// End a session on request
    pub async fn disarm(&self, wallet: WalletKey, reason: &str) -> DisarmOutcome {
        self.finish(wallet, reason, AuditEvent::Disarm).await
    }

    pub fn status(&self, wallet: WalletKey) -> ArmStatus {
        self.cache.status(wallet)
    }

    pub fn scheduled(&self, wallet: WalletKey) -> ScheduledTimers {
        ScheduledTimers {
            warn_at: self.warn_timers.deadline(&wallet),
            expire_at: self.expire_timers.deadline(&wallet),
            auto_return_at: self.auto_return.pending(wallet),
        }
    }

    /// Recompute every timer of a wallet from one expiry
    fn reschedule(&self, wallet: WalletKey, expires_at: Instant, overrides: Option<AutoReturnOverrides>) {
        let now = Instant::now();
        let warn_at = expires_at
            .checked_sub(self.config.warn_lead())
            .map_or(now, |at| at.max(now));

        let guardian = self.clone();
        self.warn_timers.schedule(wallet, warn_at, move || async move {
            guardian.on_warn(wallet).await;
        });

        let guardian = self.clone();
        self.expire_timers.schedule(wallet, expires_at, move || async move {
            guardian.on_expire(wallet).await;
        });

        self.auto_return.schedule(wallet, expires_at, overrides);
    }

    async fn on_warn(&self, wallet: WalletKey) {
        if !self.cache.status(wallet).armed {
            return;
        }

        let requires_arming = match self.wallets.wallet(wallet).await {
            Ok(Some(record)) => record.requires_arming,
            Ok(None) => {
                debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Warn skipped: unknown wallet");
                return;
            }
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Warn skipped: wallet lookup failed");
                return;
            }
        };
        if !requires_arming {
            return;
        }

        let dependents = match self.rules.count_enabled(wallet).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Warn skipped: rule count failed");
                return;
            }
        };
        if dependents.total() == 0 {
            return;
        }

        let status = self.cache.status(wallet);
        if !status.armed {
            return;
        }
        let minutes_left = status.ms_left.div_ceil(60_000);

        info!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            minutes_left,
            dependents = dependents.total(),
            "Session about to expire"
        );

        let message = format!(
            "Wallet {} disarms in {} min. Automation that needs it: {}.",
            wallet.wallet_id, minutes_left, dependents
        );
        self.notify(
            wallet.user_id,
            GuardianEvent::Warning {
                wallet,
                minutes_left,
                dependents,
            },
            message,
        );
    }

    async fn on_expire(&self, wallet: WalletKey) {
        if self.cache.status(wallet).armed {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Expire skipped: session renewed");
            return;
        }
        self.finish(wallet, EXPIRED_REASON, AuditEvent::Expire).await;
    }

    /// Shared expiry and disarm path
    async fn finish(&self, wallet: WalletKey, reason: &str, event: AuditEvent) -> DisarmOutcome {
        // Timers and key go first, before any await.
        self.warn_timers.cancel(&wallet);
        self.expire_timers.cancel(&wallet);
        self.auto_return.cancel(wallet);
        let was_armed = self.cache.disarm(wallet);

        let dependents = match self.rules.count_enabled(wallet).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Dependent rule count failed");
                DependentCounts::default()
            }
        };

        let paused = if self.config.auto_pause_on_expiry && dependents.total() > 0 {
            match self.rules.pause_all(wallet).await {
                Ok(paused) => paused.total() > 0,
                Err(e) => {
                    warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Auto-pause failed");
                    false
                }
            }
        } else {
            false
        };

        info!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            reason,
            was_armed,
            dependents = dependents.total(),
            paused,
            "Session ended"
        );

        self.audit
            .event(
                wallet.user_id,
                event,
                json!({
                    "wallet_id": wallet.wallet_id,
                    "reason": reason,
                    "was_armed": was_armed,
                    "dependents": dependents,
                    "paused": paused,
                }),
            )
            .await;

        let mut message = format!("Wallet {} disarmed ({}).", wallet.wallet_id, reason);
        if dependents.total() > 0 {
            if paused {
                message.push_str(&format!(" Paused: {}.", dependents));
            } else {
                message.push_str(&format!(" Re-arm to keep running: {}.", dependents));
            }
        }
        self.notify(
            wallet.user_id,
            GuardianEvent::Expired {
                wallet,
                reason: reason.to_string(),
                dependents,
                paused,
            },
            message,
        );

        DisarmOutcome {
            was_armed,
            dependents,
            paused,
        }
    }

    fn notify(&self, user_id: u64, event: GuardianEvent, message: String) {
        notify::dispatch(Arc::clone(&self.notifier), user_id, event, Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::TriggerOutcome;
    use crate::testing::{HangingNotifier, Harness, RecordingNotifier};

    const WALLET: WalletKey = WalletKey {
        user_id: 1,
        wallet_id: 1,
    };

    async fn with_tp_sl(h: &Harness, n: u64) {
        for id in 0..n {
            h.rules
                .insert(DependentRule {
                    id,
                    kind: DependentKind::TpSl,
                    wallet: WALLET,
                    enabled: true,
                })
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_schedules_warn_and_expire() {
        let mut config = GuardianConfig::default();
        config.warn_lead_ms = 60_000;
        let h = Harness::builder().guardian_config(config).build();
        h.add_wallet(WALLET, true).await;
        with_tp_sl(&h, 2).await;

        let start = Instant::now();
        let status = h
            .guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_millis(60_000)), None)
            .await
            .unwrap();
        assert!(status.armed);
        assert!(status.ms_left <= 60_000);

        let timers = h.guardian.scheduled(WALLET);
        assert_eq!(timers.expire_at, Some(start + Duration::from_millis(60_000)));
        assert_eq!(timers.auto_return_at, Some(start + Duration::from_millis(52_000)));

        tokio::time::sleep(Duration::from_millis(1)).await;
        let events = h.notifier.events();
        assert_eq!(
            events[0],
            GuardianEvent::Warning {
                wallet: WALLET,
                minutes_left: 1,
                dependents: DependentCounts {
                    tp_sl: 2,
                    ..Default::default()
                },
            }
        );

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert!(!h.guardian.status(WALLET).armed);
        let expired = h
            .notifier
            .events()
            .into_iter()
            .find(|e| matches!(e, GuardianEvent::Expired { .. }))
            .unwrap();
        let GuardianEvent::Expired {
            reason,
            dependents,
            paused,
            ..
        } = expired
        else {
            panic!("expected an expiry event");
        };
        assert_eq!(reason, EXPIRED_REASON);
        assert_eq!(dependents.tp_sl, 2);
        assert!(!paused);
        assert_eq!(h.guardian.scheduled(WALLET).expire_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_wipes_captured_key() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(5)), None)
            .await
            .unwrap();

        let captured = h.cache.get_dek(WALLET).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(h.cache.get_dek(WALLET).is_none());
        assert!(captured.is_wiped());
        let entries = h.audit.entries(WALLET.user_id).await.unwrap();
        assert!(entries.iter().any(|e| e.event == "expire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_absent_schedules_nothing() {
        let h = Harness::new();
        assert!(!h.guardian.extend(WALLET, Some(Duration::from_secs(60))).await);
        assert_eq!(
            h.guardian.scheduled(WALLET),
            ScheduledTimers {
                warn_at: None,
                expire_at: None,
                auto_return_at: None
            }
        );
        assert!(h.audit.entries(WALLET.user_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_moves_all_timers_together() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(600)), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        let now = Instant::now();
        assert!(h.guardian.extend(WALLET, Some(Duration::from_secs(900))).await);

        let timers = h.guardian.scheduled(WALLET);
        assert_eq!(timers.expire_at, Some(now + Duration::from_secs(900)));
        assert_eq!(timers.warn_at, Some(now + Duration::from_secs(780)));
        assert_eq!(timers.auto_return_at, Some(now + Duration::from_secs(892)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_timers_and_pauses() {
        let mut config = GuardianConfig::default();
        config.auto_pause_on_expiry = true;
        let h = Harness::builder().guardian_config(config).build();
        h.add_wallet(WALLET, true).await;
        with_tp_sl(&h, 3).await;

        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(600)), None)
            .await
            .unwrap();
        let outcome = h.guardian.disarm(WALLET, "user").await;

        assert!(outcome.was_armed);
        assert!(outcome.paused);
        assert_eq!(outcome.dependents.tp_sl, 3);
        assert_eq!(h.rules.count_enabled(WALLET).await.unwrap().total(), 0);
        assert_eq!(h.guardian.scheduled(WALLET).auto_return_at, None);
        assert_eq!(h.guardian.scheduled(WALLET).warn_at, None);

        let events: Vec<String> = h
            .audit
            .entries(WALLET.user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["arm", "disarm"]);
        assert!(h.audit.verify(WALLET.user_id).await.unwrap().is_intact());

        // A second disarm finds nothing to do.
        let again = h.guardian.disarm(WALLET, "user").await;
        assert!(!again.was_armed);
        assert!(!again.paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failure_does_not_block_expiry() {
        let h = Harness::builder()
            .notifier(RecordingNotifier::failing())
            .build();
        h.add_wallet(WALLET, true).await;
        with_tp_sl(&h, 1).await;

        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(2)), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!h.guardian.status(WALLET).armed);
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, GuardianEvent::Expired { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_warning_without_dependents() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(60)), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_clamped_and_empty_dek_rejected() {
        let h = Harness::new();
        let status = h
            .guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_millis(10)), None)
            .await
            .unwrap();
        assert_eq!(status.ms_left, 1_000);

        assert!(h.guardian.arm(WALLET, Vec::new(), None, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_alert_transport_does_not_hold_disarm() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;
        with_tp_sl(&h, 1).await;

        let guardian = Guardian::new(
            GuardianConfig::default(),
            h.cache.clone(),
            h.wallets.clone(),
            h.rules.clone(),
            h.audit.clone(),
            h.auto_return.clone(),
        )
        .with_notifier(Arc::new(HangingNotifier));
        guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(600)), None)
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), guardian.disarm(WALLET, "user"))
            .await
            .expect("disarm returned");
        assert!(outcome.was_armed);
        assert!(!guardian.status(WALLET).armed);

        let last = h.audit.entries(WALLET.user_id).await.unwrap().pop().unwrap();
        assert_eq!(last.event, "disarm");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_without_overrides_uses_stored_destination() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let earlier = solana_sdk::pubkey::Pubkey::new_unique();
        let redirect = AutoReturnOverrides {
            enabled: None,
            destination: Some(earlier.to_string()),
        };
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(5)), Some(redirect))
            .await
            .unwrap();
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(5)), None)
            .await
            .unwrap();

        // Expiry is inside the preempt window, so the run starts right away.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let record = h.auto_return.consume_recent_trigger(WALLET).unwrap();
        assert_eq!(record.destination, h.cold.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_arm_overrides() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let off = AutoReturnOverrides {
            enabled: Some(false),
            destination: None,
        };
        h.guardian
            .arm(WALLET, h.dek.clone(), Some(Duration::from_secs(60)), Some(off))
            .await
            .unwrap();
        assert!(h.guardian.extend(WALLET, Some(Duration::from_secs(60))).await);

        assert_eq!(h.auto_return.trigger(WALLET).await, TriggerOutcome::Disabled);
    }
}
