//! Wallet settings storage
//!
//! The guardian and the auto-return scheduler only read wallet records; writes
//! come from the request layer that provisions wallets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::WalletKey;

use super::types::{WalletRecord, WalletRegistry};

/// Read access to wallet settings
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn wallet(&self, key: WalletKey) -> Result<Option<WalletRecord>>;
}

/// Wallet records held in memory
#[derive(Default)]
pub struct MemoryWalletDirectory {
    wallets: RwLock<HashMap<WalletKey, WalletRecord>>,
}

impl MemoryWalletDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, record: WalletRecord) {
        self.wallets.write().await.insert(record.key(), record);
    }
}

#[async_trait]
impl WalletDirectory for MemoryWalletDirectory {
    async fn wallet(&self, key: WalletKey) -> Result<Option<WalletRecord>> {
        Ok(self.wallets.read().await.get(&key).cloned())
    }
}

/// Wallet records backed by a wallets.json registry
pub struct JsonWalletDirectory {
    path: PathBuf,
    wallets: RwLock<HashMap<WalletKey, WalletRecord>>,
}

impl JsonWalletDirectory {
    /// Load the registry; a missing file yields an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        let registry = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;

            serde_json::from_str::<WalletRegistry>(&content).map_err(|e| {
                Error::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            warn!("{} not found, creating empty registry", path.display());
            WalletRegistry::default()
        };

        for warning in validate_permissions(path) {
            warn!("{}", warning);
        }

        let wallets: HashMap<WalletKey, WalletRecord> = registry
            .wallets
            .into_iter()
            .map(|w| (w.key(), w))
            .collect();

        info!("Loaded {} wallet records", wallets.len());

        Ok(Self {
            path: path.to_path_buf(),
            wallets: RwLock::new(wallets),
        })
    }

    /// Insert or replace a record and persist the registry
    pub async fn upsert(&self, record: WalletRecord) -> Result<()> {
        let mut wallets = self.wallets.write().await;
        wallets.insert(record.key(), record);
        self.save_registry(&wallets).await
    }

    pub async fn list(&self) -> Vec<WalletRecord> {
        let mut records: Vec<WalletRecord> = self.wallets.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.key());
        records
    }

    async fn save_registry(&self, wallets: &HashMap<WalletKey, WalletRecord>) -> Result<()> {
        let mut records: Vec<WalletRecord> = wallets.values().cloned().collect();
        records.sort_by_key(|r| r.key());
        let registry = WalletRegistry {
            version: "1.0".to_string(),
            wallets: records,
        };

        let json = serde_json::to_string_pretty(&registry)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", self.path.display(), e)))?;

        info!("Saved wallet registry");
        Ok(())
    }
}

#[async_trait]
impl WalletDirectory for JsonWalletDirectory {
    async fn wallet(&self, key: WalletKey) -> Result<Option<WalletRecord>> {
        Ok(self.wallets.read().await.get(&key).cloned())
    }
}

/// Warn when the registry holding key envelopes is readable by others
fn validate_permissions(path: &Path) -> Vec<String> {
    let mut warnings = Vec::new();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                warnings.push(format!(
                    "Wallet registry {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                    path.display(),
                    mode & 0o777,
                    path.display()
                ));
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_empty_registry() {
        let dir = tempdir().unwrap();
        let directory = JsonWalletDirectory::load(&dir.path().join("wallets.json")).unwrap();
        assert!(directory.list().await.is_empty());
        assert!(directory.wallet(WalletKey::new(1, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wallet_lookup() {
        let dir = tempdir().unwrap();
        let registry = r#"{
            "version": "1.0",
            "wallets": [
                {
                    "user_id": 1,
                    "wallet_id": 1,
                    "address": "11111111111111111111111111111111",
                    "requires_arming": true,
                    "auto_return": { "enabled": true, "destination": "11111111111111111111111111111111" },
                    "created_at": "2025-01-01T00:00:00Z"
                }
            ]
        }"#;
        let path = dir.path().join("wallets.json");
        std::fs::write(&path, registry).unwrap();

        let directory = JsonWalletDirectory::load(&path).unwrap();
        let record = directory.wallet(WalletKey::new(1, 1)).await.unwrap().unwrap();
        assert!(record.auto_return.enabled);
        assert!(directory.wallet(WalletKey::new(1, 2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("wallets.json");
        let directory = JsonWalletDirectory::load(&path).unwrap();

        let mut record: WalletRecord = serde_json::from_str(
            r#"{"user_id": 4, "wallet_id": 2, "address": "11111111111111111111111111111111"}"#,
        )
        .unwrap();
        record.set_envelope(b"sealed");
        directory.upsert(record).await.unwrap();

        let reloaded = JsonWalletDirectory::load(&path).unwrap();
        let record = reloaded.wallet(WalletKey::new(4, 2)).await.unwrap().unwrap();
        assert_eq!(record.envelope().unwrap(), b"sealed".to_vec());
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_warned() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("wallets.json");
        std::fs::write(&path, r#"{"wallets": []}"#).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(validate_permissions(&path).len(), 1);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(validate_permissions(&path).is_empty());
    }
}
