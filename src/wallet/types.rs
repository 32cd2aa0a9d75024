//! Core types for wallet settings
//!
//! Defines the per-wallet record consulted by the guardian and the
//! auto-return scheduler, and the wallets.json registry layout.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::session::WalletKey;

/// Stored settings for one custodial hot wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub user_id: u64,

    pub wallet_id: u64,

    /// On-chain address of the hot wallet
    pub address: String,

    /// Automation on this wallet may only sign while armed
    #[serde(default = "default_true")]
    pub requires_arming: bool,

    /// Stored auto-return defaults
    #[serde(default)]
    pub auto_return: AutoReturnDefaults,

    /// Signing key envelope, base64 (nonce || ciphertext || tag)
    #[serde(default)]
    pub encrypted_key: Option<String>,

    /// When the wallet was added
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WalletRecord {
    pub fn key(&self) -> WalletKey {
        WalletKey::new(self.user_id, self.wallet_id)
    }

    pub fn pubkey(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.address).map_err(|e| {
            Error::Config(format!("Invalid address for {}: {}", self.key(), e))
        })
    }

    /// Decode the stored key envelope
    pub fn envelope(&self) -> Result<Vec<u8>> {
        let encoded = self.encrypted_key.as_deref().ok_or_else(|| {
            Error::InvalidKeypair(format!("No key envelope stored for {}", self.key()))
        })?;
        BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidKeypair(format!("Bad envelope for {}: {}", self.key(), e)))
    }

    pub fn set_envelope(&mut self, envelope: &[u8]) {
        self.encrypted_key = Some(BASE64.encode(envelope));
    }
}

/// Auto-return settings stored with the wallet
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoReturnDefaults {
    #[serde(default)]
    pub enabled: bool,

    /// Cold destination address
    #[serde(default)]
    pub destination: Option<String>,
}

/// Wallet registry file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRegistry {
    /// Registry format version
    #[serde(default = "default_version")]
    pub version: String,

    /// List of wallet records
    pub wallets: Vec<WalletRecord>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WalletRegistry {
    fn default() -> Self {
        Self {
            version: default_version(),
            wallets: Vec::new(),
        }
    }
}
