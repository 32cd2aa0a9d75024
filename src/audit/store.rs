//! Audit row storage

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

use super::AuditLogEntry;

/// Persistence for audit rows
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Most recent row for a user
    async fn latest(&self, user_id: u64) -> Result<Option<AuditLogEntry>>;

    async fn append(&self, entry: &AuditLogEntry) -> Result<()>;

    /// All rows for a user, oldest first
    async fn entries(&self, user_id: u64) -> Result<Vec<AuditLogEntry>>;
}

/// Rows held in memory
#[derive(Default)]
pub struct MemoryAuditStore {
    rows: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn latest(&self, user_id: u64) -> Result<Option<AuditLogEntry>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .rev()
            .find(|row| row.user_id == user_id)
            .cloned())
    }

    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.rows.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries(&self, user_id: u64) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Rows appended to a JSON-lines file
///
/// The file is scanned once for the newest row of every user; after that
/// `latest` is answered from memory and kept current by `append`. The store
/// assumes it is the only writer of the file.
pub struct JsonlAuditStore {
    path: PathBuf,
    tail: Mutex<Option<HashMap<u64, AuditLogEntry>>>,
}

impl JsonlAuditStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            tail: Mutex::new(None),
        }
    }

    async fn read_rows(&self) -> Result<Vec<AuditLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    Error::Storage(format!("{} line {}: {}", self.path.display(), n + 1, e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn latest(&self, user_id: u64) -> Result<Option<AuditLogEntry>> {
        let mut tail = self.tail.lock().await;
        if tail.is_none() {
            let mut newest = HashMap::new();
            for row in self.read_rows().await? {
                newest.insert(row.user_id, row);
            }
            *tail = Some(newest);
        }
        Ok(tail.as_ref().and_then(|newest| newest.get(&user_id).cloned()))
    }

    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        if let Some(newest) = self.tail.lock().await.as_mut() {
            newest.insert(entry.user_id, entry.clone());
        }
        Ok(())
    }

    async fn entries(&self, user_id: u64) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .read_rows()
            .await?
            .into_iter()
            .filter(|row| row.user_id == user_id)
            .collect())
    }
}
