//! Pre-expiry automatic fund return
//!
//! Moves free funds to the wallet's cold destination shortly before the
//! session key is wiped. Timeline for one armed session:
//!
//! ```text
//! arm ─────────── run_at ── grace ── attempt #1 ── [retry delay ── attempt #2] ── expiry
//!                 (expiry − preempt)
//! ```
//!
//! Every stage re-reads the session status after it resumes; a disarm or a
//! newer schedule observed there ends the run without touching balances.
//! The sweep itself checks the session before each signature. At most one
//! run per wallet is in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{AutoReturnConfig, Config};
use crate::error::{Error, Result};
use crate::guardian::notify::dispatch;
use crate::guardian::{GuardianEvent, NoopNotifier, Notifier};
use crate::session::{EnvelopeDecryptor, SessionKeyCache, WalletKey};
use crate::timer::TimerSlots;
use crate::wallet::{WalletDirectory, WalletRecord};

use super::balance::{BalanceProvider, FreeBalanceCalculator, ReservationSource, WalletBalances};
use super::executor::{validate_destination, SweepExecutor, SweepPolicy, SweepReport, TransferProvider};

/// Per-arm overrides of the wallet's stored auto-return defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReturnOverrides {
    pub enabled: Option<bool>,
    pub destination: Option<String>,
}

/// Last sweep outcome, read once by a poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentTriggerRecord {
    pub ts: DateTime<Utc>,
    pub destination: String,
    /// Empty when nothing was moved
    pub txids: Vec<String>,
}

/// How a trigger run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Session gone before any balance was read
    NotArmed,
    Disabled,
    InvalidDestination,
    /// A newer schedule moved expiry past this run
    Superseded,
    /// Another run for the wallet has not finished
    AlreadyRunning,
    /// Wallet settings could not be read
    Unavailable,
    Completed { txids: Vec<String>, attempts: u32 },
}

/// External collaborators a sweep needs
pub struct SweepPorts {
    pub wallets: Arc<dyn WalletDirectory>,
    pub balances: Arc<dyn BalanceProvider>,
    pub reservations: Arc<dyn ReservationSource>,
    pub transfers: Arc<dyn TransferProvider>,
    pub decryptor: Arc<dyn EnvelopeDecryptor>,
}

/// Schedules one pre-expiry sweep per armed wallet
#[derive(Clone)]
pub struct AutoReturnScheduler {
    config: Arc<AutoReturnConfig>,
    cache: Arc<SessionKeyCache>,
    ports: Arc<SweepPorts>,
    calculator: FreeBalanceCalculator,
    executor: Arc<SweepExecutor>,
    audit: Arc<AuditLog>,
    notifier: Arc<dyn Notifier>,
    timers: Arc<TimerSlots<WalletKey>>,
    overrides: Arc<DashMap<WalletKey, AutoReturnOverrides>>,
    recent: Arc<DashMap<WalletKey, RecentTriggerRecord>>,
    running: Arc<DashSet<WalletKey>>,
}

/// Marks a wallet's run in flight until dropped
struct RunGuard {
    running: Arc<DashSet<WalletKey>>,
    wallet: WalletKey,
}

impl RunGuard {
    fn acquire(running: &Arc<DashSet<WalletKey>>, wallet: WalletKey) -> Option<Self> {
        running.insert(wallet).then(|| Self {
            running: Arc::clone(running),
            wallet,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.wallet);
    }
}

impl AutoReturnScheduler {
    pub fn new(
        config: &Config,
        cache: Arc<SessionKeyCache>,
        ports: SweepPorts,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let policy = SweepPolicy::from_config(&config.sweep)?;
        let executor = SweepExecutor::new(
            policy,
            Arc::clone(&ports.transfers),
            Arc::clone(&ports.balances),
        );

        Ok(Self {
            config: Arc::new(config.auto_return.clone()),
            cache,
            ports: Arc::new(ports),
            calculator: FreeBalanceCalculator::new(config.sweep.fee_buffer_lamports),
            executor: Arc::new(executor),
            audit,
            notifier: Arc::new(NoopNotifier),
            timers: Arc::new(TimerSlots::new("auto_return")),
            overrides: Arc::new(DashMap::new()),
            recent: Arc::new(DashMap::new()),
            running: Arc::new(DashSet::new()),
        })
    }

    /// Publish sweep outcomes to UI subscribers
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Program the sweep for a session expiring at `expires_at`
    ///
    /// Replaces any pending run for the wallet. `None` keeps the overrides
    /// given at the last schedule. Returns the run instant.
    pub fn schedule(
        &self,
        wallet: WalletKey,
        expires_at: Instant,
        overrides: Option<AutoReturnOverrides>,
    ) -> Instant {
        if let Some(overrides) = overrides {
            self.overrides.insert(wallet, overrides);
        }

        let now = Instant::now();
        let run_at = expires_at
            .checked_sub(self.config.preempt())
            .map_or(now, |at| at.max(now));

        let scheduler = self.clone();
        self.timers.schedule(wallet, run_at, move || async move {
            scheduler.trigger(wallet).await;
        });

        debug!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            in_ms = run_at.duration_since(now).as_millis() as u64,
            "Auto-return scheduled"
        );
        run_at
    }

    /// Drop the pending run and the overrides for a wallet
    pub fn cancel(&self, wallet: WalletKey) -> bool {
        self.overrides.remove(&wallet);
        self.timers.cancel(&wallet)
    }

    /// Instant of the pending run, if any
    pub fn pending(&self, wallet: WalletKey) -> Option<Instant> {
        self.timers.deadline(&wallet)
    }

    /// Take the last recorded outcome; later calls return `None` until the next run
    pub fn consume_recent_trigger(&self, wallet: WalletKey) -> Option<RecentTriggerRecord> {
        self.recent.remove(&wallet).map(|(_, record)| record)
    }

    /// Run the sweep for a wallet now
    pub async fn trigger(&self, wallet: WalletKey) -> TriggerOutcome {
        let status = self.cache.status(wallet);
        if !status.armed || status.ms_left == 0 {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Auto-return: not armed");
            return TriggerOutcome::NotArmed;
        }
        let Some(_guard) = RunGuard::acquire(&self.running, wallet) else {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Auto-return already running");
            return TriggerOutcome::AlreadyRunning;
        };

        let record = match self.ports.wallets.wallet(wallet).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, "Auto-return: wallet not found");
                return TriggerOutcome::Unavailable;
            }
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Auto-return: wallet lookup failed");
                return TriggerOutcome::Unavailable;
            }
        };

        let overrides = self
            .overrides
            .get(&wallet)
            .map(|o| o.value().clone())
            .unwrap_or_default();

        if !overrides.enabled.unwrap_or(record.auto_return.enabled) {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Auto-return disabled");
            return TriggerOutcome::Disabled;
        }

        let (source, destination) = match resolve_route(&record, overrides.destination) {
            Ok(route) => route,
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Auto-return aborted");
                return TriggerOutcome::InvalidDestination;
            }
        };

        // Settle delay, shrunk so one attempt plus the retry still fit.
        let status = self.cache.status(wallet);
        if !status.armed {
            return TriggerOutcome::NotArmed;
        }
        let grace_ms = self
            .config
            .grace_ms
            .min(status.ms_left.saturating_sub(self.config.required_budget_ms()));
        if grace_ms > 0 {
            sleep(Duration::from_millis(grace_ms)).await;
        }

        let status = self.cache.status(wallet);
        if !status.armed {
            info!(user = wallet.user_id, wallet = wallet.wallet_id, "Disarmed before auto-return");
            return TriggerOutcome::NotArmed;
        }
        if status.ms_left > self.config.preempt_ms + self.config.safety_ms {
            debug!(
                user = wallet.user_id,
                wallet = wallet.wallet_id,
                ms_left = status.ms_left,
                "Auto-return superseded by newer schedule"
            );
            return TriggerOutcome::Superseded;
        }

        let (mut txids, mut halted) = self.attempt(wallet, &record, &source, &destination).await;
        let mut attempts = 1;

        while !halted && txids.is_empty() && self.config.retry_on_empty && attempts <= self.config.retry_max {
            let ms_left = self.cache.status(wallet).ms_left;
            if ms_left <= self.config.safety_ms {
                warn!(
                    user = wallet.user_id,
                    wallet = wallet.wallet_id,
                    "{}",
                    Error::RetryBudgetExhausted { ms_left }
                );
                break;
            }

            let delay_ms = self.config.retry_delay_ms.min(ms_left - self.config.safety_ms);
            sleep(Duration::from_millis(delay_ms)).await;

            if !self.cache.status(wallet).armed {
                info!(user = wallet.user_id, wallet = wallet.wallet_id, "Disarmed before auto-return retry");
                break;
            }

            debug!(user = wallet.user_id, wallet = wallet.wallet_id, attempt = attempts + 1, "Auto-return retry");
            (txids, halted) = self.attempt(wallet, &record, &source, &destination).await;
            attempts += 1;
        }

        if halted {
            // Whatever was signed before the session ended is still reported.
            if !txids.is_empty() {
                self.record(wallet, &destination, &txids, attempts).await;
            }
            return TriggerOutcome::NotArmed;
        }

        self.record(wallet, &destination, &txids, attempts).await;
        TriggerOutcome::Completed { txids, attempts }
    }

    /// One read-compute-sign-send pass; failures yield no txids
    ///
    /// The flag is set when the session ended mid-sweep.
    async fn attempt(
        &self,
        wallet: WalletKey,
        record: &WalletRecord,
        source: &Pubkey,
        destination: &Pubkey,
    ) -> (Vec<String>, bool) {
        match self.sweep_once(wallet, record, source, destination).await {
            Ok(report) => {
                if !report.failures.is_empty() {
                    warn!(
                        user = wallet.user_id,
                        wallet = wallet.wallet_id,
                        failed = report.failures.len(),
                        sent = report.txids.len(),
                        "Auto-return partially completed"
                    );
                }
                let txids = report.txids.iter().map(|sig| sig.to_string()).collect();
                (txids, report.halted)
            }
            Err(e) => {
                warn!(user = wallet.user_id, wallet = wallet.wallet_id, error = %e, "Auto-return attempt failed");
                (Vec::new(), false)
            }
        }
    }

    async fn sweep_once(
        &self,
        wallet: WalletKey,
        record: &WalletRecord,
        source: &Pubkey,
        destination: &Pubkey,
    ) -> Result<SweepReport> {
        let balances = WalletBalances::fetch(self.ports.balances.as_ref(), source).await?;
        let reservations = self.ports.reservations.reservations(wallet).await?;
        let snapshot = self.calculator.compute(&balances, &reservations);
        if snapshot.is_empty() {
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Nothing free to sweep");
            return Ok(SweepReport::default());
        }

        let envelope = record.envelope()?;
        let signer = {
            let secret = self
                .cache
                .unlock(wallet, &envelope, self.ports.decryptor.as_ref())?;
            Keypair::from_bytes(&secret).map_err(|e| Error::InvalidKeypair(e.to_string()))?
        };
        if signer.pubkey() != *source {
            return Err(Error::InvalidKeypair(format!(
                "decrypted key does not match {}",
                source
            )));
        }

        let cache = Arc::clone(&self.cache);
        let is_armed = move || cache.status(wallet).armed;
        self.executor
            .execute(&signer, &snapshot, destination, &is_armed)
            .await
    }

    async fn record(&self, wallet: WalletKey, destination: &Pubkey, txids: &[String], attempts: u32) {
        self.recent.insert(
            wallet,
            RecentTriggerRecord {
                ts: Utc::now(),
                destination: destination.to_string(),
                txids: txids.to_vec(),
            },
        );

        info!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            destination = %destination,
            transfers = txids.len(),
            attempts,
            "Auto-return finished"
        );

        self.audit
            .event(
                wallet.user_id,
                AuditEvent::AutoReturn,
                json!({
                    "wallet_id": wallet.wallet_id,
                    "destination": destination.to_string(),
                    "txids": txids,
                    "attempts": attempts,
                }),
            )
            .await;

        let event = GuardianEvent::AutoReturn {
            wallet,
            destination: destination.to_string(),
            txids: txids.to_vec(),
        };
        dispatch(Arc::clone(&self.notifier), wallet.user_id, event, None);
    }
}

fn resolve_route(record: &WalletRecord, destination: Option<String>) -> Result<(Pubkey, Pubkey)> {
    let source = record.pubkey()?;
    let destination = destination
        .or_else(|| record.auto_return.destination.clone())
        .ok_or_else(|| Error::InvalidDestination("no destination configured".to_string()))?;
    let destination = validate_destination(&destination, &source)?;
    Ok((source, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::balance::TokenBalance;
    use crate::testing::{FakeBalances, FakeTransfers, Harness};

    const WALLET: WalletKey = WalletKey {
        user_id: 1,
        wallet_id: 1,
    };

    fn harness_with(balances: FakeBalances, transfers: FakeTransfers) -> Harness {
        Harness::builder()
            .balances(balances)
            .transfers(transfers)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_preempt_before_expiry() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let start = Instant::now();
        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(10_000));
        let run_at = h.auto_return.schedule(WALLET, expires_at, None);
        assert_eq!(run_at, start + Duration::from_millis(2_000));
        assert_eq!(h.auto_return.pending(WALLET), Some(run_at));

        // Expiry closer than preempt runs immediately.
        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(3_000));
        assert_eq!(h.auto_return.schedule(WALLET, expires_at, None), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_empty_attempt() {
        let h = harness_with(FakeBalances::new(5_000_000, vec![]), FakeTransfers::failing_all());
        h.add_wallet(WALLET, true).await;

        let start = Instant::now();
        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(10_000));
        h.auto_return.schedule(WALLET, expires_at, None);

        tokio::time::sleep(Duration::from_millis(9_000)).await;

        // run_at = +2000; grace = min(1500, 8000 - 7000) = 1000;
        // retry delay = min(1500, 7000 - 500) = 1500. Each attempt reads the
        // native balance again before the native leg.
        let reads = h.balances.read_times.lock().unwrap().clone();
        let first = start + Duration::from_millis(3_000);
        let second = start + Duration::from_millis(4_500);
        assert_eq!(reads, vec![first, first, second, second]);
        assert_eq!(h.transfers.calls().len(), 2);

        let record = h.auto_return.consume_recent_trigger(WALLET).unwrap();
        assert!(record.txids.is_empty());
        assert_eq!(record.destination, h.cold.to_string());
        assert!(h.auto_return.consume_recent_trigger(WALLET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_bounded_by_time_left() {
        let h = harness_with(FakeBalances::new(0, vec![]), FakeTransfers::default());
        h.add_wallet(WALLET, true).await;

        let start = Instant::now();
        h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(1_800));

        let outcome = h.auto_return.trigger(WALLET).await;
        assert_eq!(
            outcome,
            TriggerOutcome::Completed {
                txids: vec![],
                attempts: 2
            }
        );

        // No grace (budget exceeds time left); retry waits 1800 - 500.
        let reads = h.balances.read_times.lock().unwrap().clone();
        assert_eq!(
            reads,
            vec![start, start + Duration::from_millis(1_300)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_during_grace_reads_nothing() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(10_000));
        h.auto_return.schedule(WALLET, expires_at, None);

        // Inside the 1000ms grace window that starts at +2000.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.cache.disarm(WALLET);
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert_eq!(h.balances.reads(), 0);
        assert!(h.transfers.calls().is_empty());
        assert!(h.auto_return.consume_recent_trigger(WALLET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_with_decrypted_key() {
        let mint = Pubkey::new_unique();
        let balances = FakeBalances::new(
            1_000_000_000,
            vec![TokenBalance {
                mint,
                account: Pubkey::new_unique(),
                amount: 42,
                decimals: 6,
            }],
        );
        let h = harness_with(balances, FakeTransfers::default());
        h.add_wallet(WALLET, true).await;
        h.reservations.reserve(WALLET, None, 200_000_000).await;

        h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(5_000));
        let outcome = h.auto_return.trigger(WALLET).await;

        let TriggerOutcome::Completed { txids, attempts } = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(txids.len(), 2);
        assert_eq!(attempts, 1);

        let calls = h.transfers.calls();
        assert_eq!(calls[0].1.mint(), Some(mint));
        assert_eq!(calls[1].1, crate::sweep::SweepAsset::Native);
        // Free amount less the rent-exempt floor left behind.
        assert_eq!(calls[1].2, 799_990_000 - 890_880);
        assert!(calls.iter().all(|(dest, _, _)| *dest == h.cold));

        let entries = h.audit.entries(WALLET.user_id).await.unwrap();
        assert_eq!(entries.last().unwrap().event, "auto_return");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_disable_and_persist() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(20_000));
        let off = AutoReturnOverrides {
            enabled: Some(false),
            destination: None,
        };
        h.auto_return.schedule(WALLET, expires_at, Some(off));

        // Reschedule without overrides keeps the disabled flag.
        let expires_at = h.cache.extend(WALLET, Duration::from_millis(20_000)).unwrap();
        h.auto_return.schedule(WALLET, expires_at, None);
        assert_eq!(h.auto_return.trigger(WALLET).await, TriggerOutcome::Disabled);

        assert!(h.auto_return.cancel(WALLET));
        assert!(h.auto_return.pending(WALLET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_checks() {
        let h = Harness::new();
        let record = h.add_wallet(WALLET, true).await;
        h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(5_000));

        let to_self = AutoReturnOverrides {
            enabled: None,
            destination: Some(record.address.clone()),
        };
        h.auto_return.schedule(WALLET, Instant::now() + Duration::from_secs(60), Some(to_self));
        assert_eq!(
            h.auto_return.trigger(WALLET).await,
            TriggerOutcome::InvalidDestination
        );
        assert_eq!(h.balances.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_run_skips() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(10_000));
        h.auto_return.schedule(WALLET, expires_at, None);

        // The run started at +2000 is in grace when the session is extended
        // without rescheduling the sweep.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.cache.extend(WALLET, Duration::from_millis(60_000));
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(h.balances.reads(), 0);
        assert!(h.auto_return.consume_recent_trigger(WALLET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_inside_safety_margin() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(400));
        let outcome = h.auto_return.trigger(WALLET).await;

        assert_eq!(
            outcome,
            TriggerOutcome::Completed {
                txids: vec![],
                attempts: 1
            }
        );
        assert_eq!(h.balances.reads(), 1);
        assert!(h.auto_return.consume_recent_trigger(WALLET).unwrap().txids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_while_running_is_refused() {
        let h = Harness::new();
        h.add_wallet(WALLET, true).await;

        let expires_at = h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(10_000));
        h.auto_return.schedule(WALLET, expires_at, None);

        // The scheduled run is in its grace delay.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(h.auto_return.trigger(WALLET).await, TriggerOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(h.auto_return.consume_recent_trigger(WALLET).is_some());

        // Finished runs release the wallet.
        assert!(matches!(
            h.auto_return.trigger(WALLET).await,
            TriggerOutcome::Completed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_mid_sweep_stops_signing() {
        let balances = FakeBalances::new(
            1_000_000_000,
            vec![
                TokenBalance {
                    mint: Pubkey::new_unique(),
                    account: Pubkey::new_unique(),
                    amount: 10,
                    decimals: 6,
                },
                TokenBalance {
                    mint: Pubkey::new_unique(),
                    account: Pubkey::new_unique(),
                    amount: 20,
                    decimals: 6,
                },
            ],
        );
        let h = harness_with(balances, FakeTransfers::default());
        h.add_wallet(WALLET, true).await;
        h.cache.arm(WALLET, h.dek.clone(), Duration::from_millis(5_000));

        let cache = h.cache.clone();
        h.transfers.on_transfer(move |_| {
            cache.disarm(WALLET);
        });

        assert_eq!(h.auto_return.trigger(WALLET).await, TriggerOutcome::NotArmed);
        assert_eq!(h.transfers.calls().len(), 1);

        // The one transfer that went out is still reported.
        let record = h.auto_return.consume_recent_trigger(WALLET).unwrap();
        assert_eq!(record.txids.len(), 1);
    }
}
