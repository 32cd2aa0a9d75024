//! Tamper-evident audit trail
//!
//! Every arm/extend/disarm/expire (and each auto-return outcome) is appended
//! as one row per user. Rows are chained:
//!
//! ```text
//! hash = HMAC-SHA256(secret, prev_hash || event || canonical_json(meta))
//! ```
//!
//! where `prev_hash` is the hash of the user's previous row, or the empty
//! string for the first one. Persist failures are logged and swallowed: the
//! security action that triggered the event always completes.

pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};

type HmacSha256 = Hmac<Sha256>;

/// Audited event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Arm,
    Extend,
    Disarm,
    Expire,
    AutoReturn,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Arm => "arm",
            AuditEvent::Extend => "extend",
            AuditEvent::Disarm => "disarm",
            AuditEvent::Expire => "expire",
            AuditEvent::AutoReturn => "auto_return",
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: u64,
    pub event: String,
    pub meta_json: String,
    pub prev_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// First row whose stored hash does not verify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub index: usize,
    pub entry_id: Uuid,
    pub reason: String,
}

/// Result of verifying a user's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: usize,
    pub broken: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken.is_none()
    }
}

/// Append-only, hash-chained event recorder
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    secret: Zeroizing<Vec<u8>>,
    // Serializes read-latest + append so concurrent events cannot fork a chain.
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>, secret: &[u8]) -> Self {
        Self {
            store,
            secret: Zeroizing::new(secret.to_vec()),
            append_lock: Mutex::new(()),
        }
    }

    /// Record an event; failures are logged and yield `None`
    pub async fn event(&self, user_id: u64, event: AuditEvent, meta: Value) -> Option<AuditLogEntry> {
        match self.append(user_id, event, &meta).await {
            Ok(entry) => {
                debug!(user = user_id, event = %event, hash = %entry.hash, "Audit event recorded");
                Some(entry)
            }
            Err(e) => {
                warn!(user = user_id, event = %event, error = %e, "Audit persist failed");
                None
            }
        }
    }

    async fn append(&self, user_id: u64, event: AuditEvent, meta: &Value) -> Result<AuditLogEntry> {
        let _guard = self.append_lock.lock().await;

        let prev_hash = self
            .store
            .latest(user_id)
            .await
            .map_err(|e| Error::AuditPersist(e.to_string()))?
            .map(|entry| entry.hash)
            .unwrap_or_default();

        let meta_json = canonical_json(meta);
        let hash = compute_hash(&self.secret, &prev_hash, event.as_str(), &meta_json)?;

        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            user_id,
            event: event.as_str().to_string(),
            meta_json,
            prev_hash,
            hash,
            timestamp: Utc::now(),
        };

        self.store
            .append(&entry)
            .await
            .map_err(|e| Error::AuditPersist(e.to_string()))?;

        Ok(entry)
    }

    /// All rows for a user, oldest first
    pub async fn entries(&self, user_id: u64) -> Result<Vec<AuditLogEntry>> {
        self.store.entries(user_id).await
    }

    /// Recompute every hash of a user's chain
    pub async fn verify(&self, user_id: u64) -> Result<ChainReport> {
        let entries = self.store.entries(user_id).await?;
        Ok(verify_chain(&self.secret, &entries))
    }
}

/// HMAC over `prev_hash || event || meta_json`, hex encoded
pub fn compute_hash(secret: &[u8], prev_hash: &str, event: &str, meta_json: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Internal(format!("invalid audit secret: {}", e)))?;
    mac.update(prev_hash.as_bytes());
    mac.update(event.as_bytes());
    mac.update(meta_json.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a chain of rows belonging to one user, oldest first
pub fn verify_chain(secret: &[u8], entries: &[AuditLogEntry]) -> ChainReport {
    let mut expected_prev = String::new();

    for (index, entry) in entries.iter().enumerate() {
        let broken = |reason: String| ChainReport {
            entries: entries.len(),
            broken: Some(ChainBreak {
                index,
                entry_id: entry.id,
                reason,
            }),
        };

        if entry.prev_hash != expected_prev {
            return broken("prev_hash does not match previous row".to_string());
        }

        let computed = match compute_hash(secret, &entry.prev_hash, &entry.event, &entry.meta_json) {
            Ok(hash) => hash,
            Err(e) => return broken(e.to_string()),
        };

        if !hashes_match(&entry.hash, &computed) {
            return broken("hash does not match contents".to_string());
        }

        expected_prev = entry.hash.clone();
    }

    ChainReport {
        entries: entries.len(),
        broken: None,
    }
}

fn hashes_match(stored: &str, computed: &str) -> bool {
    match (hex::decode(stored), hex::decode(computed)) {
        (Ok(expected), Ok(actual)) if expected.len() == actual.len() => {
            expected.ct_eq(actual.as_slice()).into()
        }
        _ => false,
    }
}

/// Deterministic JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
