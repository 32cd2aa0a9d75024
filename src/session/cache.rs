//! In-memory time-boxed key cache

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

use super::crypto::{wallet_aad, EnvelopeDecryptor};
use super::key::{KeyMaterial, WalletKey};

/// One armed session
struct ArmSession {
    key: Arc<KeyMaterial>,
    armed_at: DateTime<Utc>,
    ttl: Duration,
    expires_at: Instant,
}

impl ArmSession {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Live view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmStatus {
    pub armed: bool,
    pub ms_left: u64,
    pub armed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<Instant>,
}

impl ArmStatus {
    fn disarmed() -> Self {
        Self {
            armed: false,
            ms_left: 0,
            armed_at: None,
            expires_at: None,
        }
    }
}

/// Process-wide map of wallet -> decrypted DEK with expiry
///
/// Expiry is lazy: a session past its deadline reads as absent even if no
/// timer has removed it yet.
#[derive(Default)]
pub struct SessionKeyCache {
    sessions: DashMap<WalletKey, ArmSession>,
}

impl SessionKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a DEK for `ttl`, wiping any previous key for the wallet
    ///
    /// Returns the new expiry instant.
    pub fn arm(&self, wallet: WalletKey, key_bytes: Vec<u8>, ttl: Duration) -> Instant {
        let expires_at = Instant::now() + ttl;
        let session = ArmSession {
            key: Arc::new(KeyMaterial::new(key_bytes)),
            armed_at: Utc::now(),
            ttl,
            expires_at,
        };

        if let Some(previous) = self.sessions.insert(wallet, session) {
            previous.key.wipe();
            debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Replaced armed key");
        }

        info!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            ttl_ms = ttl.as_millis() as u64,
            "Wallet armed"
        );
        expires_at
    }

    /// Push the expiry of a live session to now + `ttl`
    ///
    /// Returns `None` when the wallet has no live session.
    pub fn extend(&self, wallet: WalletKey, ttl: Duration) -> Option<Instant> {
        let now = Instant::now();
        let mut session = self.sessions.get_mut(&wallet)?;
        if !session.is_live(now) {
            return None;
        }
        session.ttl = ttl;
        session.expires_at = now + ttl;
        debug!(
            user = wallet.user_id,
            wallet = wallet.wallet_id,
            ttl_ms = ttl.as_millis() as u64,
            "Session extended"
        );
        Some(session.expires_at)
    }

    /// Remove the session, wiping its key before returning
    ///
    /// Returns whether a live session existed.
    pub fn disarm(&self, wallet: WalletKey) -> bool {
        match self.sessions.remove(&wallet) {
            Some((_, session)) => {
                session.key.wipe();
                info!(user = wallet.user_id, wallet = wallet.wallet_id, "Wallet disarmed");
                session.is_live(Instant::now())
            }
            None => false,
        }
    }

    /// Shared handle to the DEK if the wallet is armed
    ///
    /// The handle must only be used for one synchronous call; it is wiped
    /// in place when the session ends.
    pub fn get_dek(&self, wallet: WalletKey) -> Option<Arc<KeyMaterial>> {
        let now = Instant::now();
        {
            let session = self.sessions.get(&wallet)?;
            if session.is_live(now) {
                return Some(Arc::clone(&session.key));
            }
        }
        self.evict_expired(wallet, now);
        None
    }

    /// Run `f` with the DEK borrowed, or fail with `NotArmed`
    pub fn with_dek<R>(&self, wallet: WalletKey, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let key = self.get_dek(wallet).ok_or(Error::NotArmed {
            user_id: wallet.user_id,
            wallet_id: wallet.wallet_id,
        })?;
        Ok(key.expose(f))
    }

    /// Decrypt a wallet's signing key envelope with the cached DEK
    ///
    /// The AAD binds the decryption to this user and wallet.
    pub fn unlock(
        &self,
        wallet: WalletKey,
        envelope: &[u8],
        decryptor: &dyn EnvelopeDecryptor,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let aad = wallet_aad(wallet);
        self.with_dek(wallet, |dek| decryptor.decrypt(envelope, dek, aad.as_bytes()))?
    }

    pub fn status(&self, wallet: WalletKey) -> ArmStatus {
        let now = Instant::now();
        match self.sessions.get(&wallet) {
            Some(session) if session.is_live(now) => ArmStatus {
                armed: true,
                ms_left: session.expires_at.duration_since(now).as_millis() as u64,
                armed_at: Some(session.armed_at),
                expires_at: Some(session.expires_at),
            },
            _ => ArmStatus::disarmed(),
        }
    }

    /// TTL the session was last armed or extended with
    pub fn ttl(&self, wallet: WalletKey) -> Option<Duration> {
        let now = Instant::now();
        self.sessions
            .get(&wallet)
            .filter(|session| session.is_live(now))
            .map(|session| session.ttl)
    }

    /// Wipe and drop every session past its expiry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<WalletKey> = self
            .sessions
            .iter()
            .filter(|entry| !entry.is_live(now))
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter(|wallet| self.evict_expired(*wallet, now))
            .count()
    }

    /// Number of live sessions
    pub fn armed_count(&self) -> usize {
        let now = Instant::now();
        self.sessions.iter().filter(|entry| entry.is_live(now)).count()
    }

    fn evict_expired(&self, wallet: WalletKey, now: Instant) -> bool {
        match self.sessions.remove_if(&wallet, |_, session| !session.is_live(now)) {
            Some((_, session)) => {
                session.key.wipe();
                debug!(user = wallet.user_id, wallet = wallet.wallet_id, "Expired key evicted");
                true
            }
            None => false,
        }
    }
}
