//! Best-effort notification ports
//!
//! The guardian never waits on delivery: sends run on a background task with
//! a bounded wait, and every error is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::WalletKey;

use super::rules::DependentCounts;

/// Events published to UI subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardianEvent {
    /// The session is about to expire
    Warning {
        wallet: WalletKey,
        minutes_left: u64,
        dependents: DependentCounts,
    },
    /// The session ended (timeout or user disarm)
    Expired {
        wallet: WalletKey,
        reason: String,
        dependents: DependentCounts,
        paused: bool,
    },
    /// Free funds were swept before expiry
    AutoReturn {
        wallet: WalletKey,
        destination: String,
        txids: Vec<String>,
    },
}

impl GuardianEvent {
    pub fn wallet(&self) -> WalletKey {
        match self {
            GuardianEvent::Warning { wallet, .. }
            | GuardianEvent::Expired { wallet, .. }
            | GuardianEvent::AutoReturn { wallet, .. } => *wallet,
        }
    }
}

/// UI event and chat alert transport
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, _user_id: u64, _event: &GuardianEvent) -> Result<()> {
        Ok(())
    }

    async fn alert(&self, _user_id: u64, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Longest wait for one transport call
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Publish `event`, then send `alert` if any, on a background task
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    user_id: u64,
    event: GuardianEvent,
    alert: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match timeout(DELIVERY_TIMEOUT, notifier.publish(user_id, &event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(user = user_id, error = %e, "Event publish failed"),
            Err(_) => warn!(user = user_id, "Event publish timed out"),
        }

        let Some(message) = alert else {
            return;
        };
        match timeout(DELIVERY_TIMEOUT, notifier.alert(user_id, &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(user = user_id, error = %e, "Alert send failed"),
            Err(_) => warn!(user = user_id, "Alert send timed out"),
        }
    })
}

/// Drops everything
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {}

/// Message delivered to broadcast subscribers
#[derive(Debug, Clone)]
pub enum Notification {
    Event { user_id: u64, event: GuardianEvent },
    Alert { user_id: u64, message: String },
}

/// Fans events out to in-process subscribers
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    fn send(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map(|_| ())
            .map_err(|_| Error::Notification("no subscribers".to_string()))
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, user_id: u64, event: &GuardianEvent) -> Result<()> {
        self.send(Notification::Event {
            user_id,
            event: event.clone(),
        })
    }

    async fn alert(&self, user_id: u64, message: &str) -> Result<()> {
        info!(user = user_id, "ALERT: {}", message);
        self.send(Notification::Alert {
            user_id,
            message: message.to_string(),
        })
    }
}

/// Sends to every inner notifier; fails if any of them failed
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn publish(&self, user_id: u64, event: &GuardianEvent) -> Result<()> {
        let mut failed = 0;
        for notifier in &self.inner {
            if let Err(e) = notifier.publish(user_id, event).await {
                warn!(user = user_id, error = %e, "Event publish failed");
                failed += 1;
            }
        }
        fanout_result(failed, self.inner.len())
    }

    async fn alert(&self, user_id: u64, message: &str) -> Result<()> {
        let mut failed = 0;
        for notifier in &self.inner {
            if let Err(e) = notifier.alert(user_id, message).await {
                warn!(user = user_id, error = %e, "Alert send failed");
                failed += 1;
            }
        }
        fanout_result(failed, self.inner.len())
    }
}

fn fanout_result(failed: usize, total: usize) -> Result<()> {
    if failed == 0 {
        Ok(())
    } else {
        Err(Error::Notification(format!("{}/{} transports failed", failed, total)))
    }
}
