//! Wallet settings
//!
//! Per-wallet records consulted while a wallet is armed:
//! - whether automation on the wallet requires arming
//! - stored auto-return defaults (enabled flag, cold destination)
//! - the encrypted signing key envelope
//!
//! Records come from a [`WalletDirectory`]; an in-memory and a wallets.json
//! implementation are provided.

pub mod directory;
pub mod types;

pub use directory::{JsonWalletDirectory, MemoryWalletDirectory, WalletDirectory};
pub use types::{AutoReturnDefaults, WalletRecord, WalletRegistry};
