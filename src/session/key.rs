//! Session keys and key material

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use zeroize::Zeroize;

/// Identifies one wallet of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    pub user_id: u64,
    pub wallet_id: u64,
}

impl WalletKey {
    pub fn new(user_id: u64, wallet_id: u64) -> Self {
        Self { user_id, wallet_id }
    }
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user {} / wallet {}", self.user_id, self.wallet_id)
    }
}

/// Decrypted key bytes owned by the session cache
///
/// Wiping overwrites the buffer in place, so every holder of a shared handle
/// observes zeros afterwards. Dropping the last handle wipes as well.
pub struct KeyMaterial {
    bytes: RwLock<Vec<u8>>,
}

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Borrow the bytes for one synchronous call
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Zero-fill the buffer in place
    pub fn wipe(&self) {
        let mut guard = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut_slice().zeroize();
    }

    pub fn is_wiped(&self) -> bool {
        self.expose(|bytes| bytes.iter().all(|b| *b == 0))
    }

    pub fn len(&self) -> usize {
        self.expose(|bytes| bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        let bytes = self.bytes.get_mut().unwrap_or_else(PoisonError::into_inner);
        bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.len())
    }
}
