//! Shared test doubles

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::audit::{AuditLog, MemoryAuditStore};
use crate::config::{Config, GuardianConfig};
use crate::error::{Error, Result};
use crate::guardian::{Guardian, GuardianEvent, MemoryRulesRepository, Notifier};
use crate::session::{wallet_aad, EnvelopeDecryptor, SessionKeyCache, WalletKey};
use crate::sweep::{
    AutoReturnScheduler, BalanceProvider, MemoryReservations, SweepAsset, SweepPorts,
    TokenBalance, TransferProvider,
};
use crate::wallet::{AutoReturnDefaults, MemoryWalletDirectory, WalletRecord};

/// XOR "cipher" with the AAD embedded as a prefix
pub struct XorDecryptor;

impl XorDecryptor {
    pub fn seal(plain: &[u8], dek: &[u8], wallet: WalletKey) -> Vec<u8> {
        let aad = wallet_aad(wallet);
        let mut out = vec![aad.len() as u8];
        out.extend_from_slice(aad.as_bytes());
        out.extend(plain.iter().enumerate().map(|(i, b)| b ^ dek[i % dek.len()]));
        out
    }
}

impl EnvelopeDecryptor for XorDecryptor {
    fn decrypt(&self, envelope: &[u8], dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let aad_len = *envelope.first().ok_or(Error::Decrypt("empty".into()))? as usize;
        if envelope.len() < 1 + aad_len || &envelope[1..1 + aad_len] != aad {
            return Err(Error::Decrypt("aad mismatch".into()));
        }
        let body = &envelope[1 + aad_len..];
        Ok(Zeroizing::new(
            body.iter()
                .enumerate()
                .map(|(i, b)| b ^ dek[i % dek.len()])
                .collect(),
        ))
    }
}

/// Captures every event and alert
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(u64, GuardianEvent)>>,
    pub alerts: Mutex<Vec<(u64, String)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<GuardianEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, user_id: u64, event: &GuardianEvent) -> Result<()> {
        self.events.lock().unwrap().push((user_id, event.clone()));
        if self.fail {
            return Err(Error::Notification("transport down".into()));
        }
        Ok(())
    }

    async fn alert(&self, user_id: u64, message: &str) -> Result<()> {
        self.alerts.lock().unwrap().push((user_id, message.to_string()));
        if self.fail {
            return Err(Error::Notification("transport down".into()));
        }
        Ok(())
    }
}

/// Never completes an alert
pub struct HangingNotifier;

#[async_trait]
impl Notifier for HangingNotifier {
    async fn publish(&self, _user_id: u64, _event: &GuardianEvent) -> Result<()> {
        Ok(())
    }

    async fn alert(&self, _user_id: u64, _message: &str) -> Result<()> {
        std::future::pending().await
    }
}

/// Settable balances with a read counter
#[derive(Default)]
pub struct FakeBalances {
    pub native: AtomicU64,
    pub tokens: Vec<TokenBalance>,
    pub reads: AtomicUsize,
    pub read_times: Mutex<Vec<Instant>>,
}

impl FakeBalances {
    pub fn new(native: u64, tokens: Vec<TokenBalance>) -> Self {
        Self {
            native: AtomicU64::new(native),
            tokens,
            ..Default::default()
        }
    }

    pub fn set_native(&self, lamports: u64) {
        self.native.store(lamports, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceProvider for FakeBalances {
    async fn native_balance(&self, _owner: &Pubkey) -> Result<u64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.read_times.lock().unwrap().push(Instant::now());
        Ok(self.native.load(Ordering::SeqCst))
    }

    async fn token_balances(&self, _owner: &Pubkey) -> Result<Vec<TokenBalance>> {
        Ok(self.tokens.clone())
    }
}

type TransferHook = Box<dyn Fn(usize) + Send + Sync>;

/// Records transfers; mints listed in `failing` (or everything) fail
#[derive(Default)]
pub struct FakeTransfers {
    pub calls: Mutex<Vec<(Pubkey, SweepAsset, u64)>>,
    pub unwrapped: Mutex<Vec<Pubkey>>,
    pub failing: Mutex<HashSet<Option<Pubkey>>>,
    pub fail_all: bool,
    hook: Mutex<Option<TransferHook>>,
}

impl FakeTransfers {
    pub fn failing_all() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    pub fn fail_mint(&self, mint: Option<Pubkey>) {
        self.failing.lock().unwrap().insert(mint);
    }

    /// Run `hook` after each recorded transfer with its zero-based index
    pub fn on_transfer(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<(Pubkey, SweepAsset, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferProvider for FakeTransfers {
    async fn transfer(
        &self,
        _signer: &Keypair,
        destination: &Pubkey,
        asset: &SweepAsset,
        amount: u64,
    ) -> Result<Signature> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((*destination, asset.clone(), amount));
            calls.len() - 1
        };
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(index);
        }
        let failing = self.fail_all || self.failing.lock().unwrap().contains(&asset.mint());
        if failing {
            return Err(Error::Rpc("node is behind".into()));
        }
        Ok(Signature::new_unique())
    }

    async fn unwrap_native(&self, _signer: &Keypair, account: &Pubkey) -> Result<Signature> {
        self.unwrapped.lock().unwrap().push(*account);
        Ok(Signature::new_unique())
    }
}

/// Guardian and auto-return wired to in-memory stores and fakes
pub struct Harness {
    pub cache: Arc<SessionKeyCache>,
    pub wallets: Arc<MemoryWalletDirectory>,
    pub rules: Arc<MemoryRulesRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<AuditLog>,
    pub balances: Arc<FakeBalances>,
    pub transfers: Arc<FakeTransfers>,
    pub reservations: Arc<MemoryReservations>,
    pub auto_return: AutoReturnScheduler,
    pub guardian: Guardian,
    pub dek: Vec<u8>,
    pub cold: Pubkey,
}

impl Harness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Register a wallet whose key envelope opens with `self.dek`
    pub async fn add_wallet(&self, wallet: WalletKey, requires_arming: bool) -> WalletRecord {
        let keypair = Keypair::new();
        let mut record = WalletRecord {
            user_id: wallet.user_id,
            wallet_id: wallet.wallet_id,
            address: keypair.pubkey().to_string(),
            requires_arming,
            auto_return: AutoReturnDefaults {
                enabled: true,
                destination: Some(self.cold.to_string()),
            },
            encrypted_key: None,
            created_at: Utc::now(),
        };
        record.set_envelope(&XorDecryptor::seal(&keypair.to_bytes(), &self.dek, wallet));
        self.wallets.upsert(record.clone()).await;
        record
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    guardian: Option<GuardianConfig>,
    balances: Option<FakeBalances>,
    transfers: Option<FakeTransfers>,
    notifier: Option<RecordingNotifier>,
}

impl HarnessBuilder {
    pub fn guardian_config(mut self, config: GuardianConfig) -> Self {
        self.guardian = Some(config);
        self
    }

    pub fn balances(mut self, balances: FakeBalances) -> Self {
        self.balances = Some(balances);
        self
    }

    pub fn transfers(mut self, transfers: FakeTransfers) -> Self {
        self.transfers = Some(transfers);
        self
    }

    pub fn notifier(mut self, notifier: RecordingNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Harness {
        let mut config = Config::default();
        if let Some(guardian) = self.guardian {
            config.guardian = guardian;
        }

        let cache = Arc::new(SessionKeyCache::new());
        let wallets = Arc::new(MemoryWalletDirectory::new());
        let rules = Arc::new(MemoryRulesRepository::new());
        let notifier = Arc::new(self.notifier.unwrap_or_default());
        let audit = Arc::new(AuditLog::new(Arc::new(MemoryAuditStore::new()), b"test-secret"));
        let balances = Arc::new(self.balances.unwrap_or_default());
        let transfers = Arc::new(self.transfers.unwrap_or_default());
        let reservations = Arc::new(MemoryReservations::new());

        let ports = SweepPorts {
            wallets: wallets.clone(),
            balances: balances.clone(),
            reservations: reservations.clone(),
            transfers: transfers.clone(),
            decryptor: Arc::new(XorDecryptor),
        };
        let auto_return = AutoReturnScheduler::new(&config, cache.clone(), ports, audit.clone())
            .unwrap()
            .with_notifier(notifier.clone());

        let guardian = Guardian::new(
            config.guardian.clone(),
            cache.clone(),
            wallets.clone(),
            rules.clone(),
            audit.clone(),
            auto_return.clone(),
        )
        .with_notifier(notifier.clone());

        Harness {
            cache,
            wallets,
            rules,
            notifier,
            audit,
            balances,
            transfers,
            reservations,
            auto_return,
            guardian,
            dek: vec![0x42; 32],
            cold: Pubkey::new_unique(),
        }
    }
}
