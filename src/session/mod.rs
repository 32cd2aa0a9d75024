//! Armed session key cache
//!
//! Holds decrypted data-encryption keys (DEKs) for hot wallets while they are
//! armed. The cache is the only owner of key bytes; every removal path wipes
//! them before returning.
//!
//! # Architecture
//!
//! ```text
//! Guardian ──arm/extend/disarm──► SessionKeyCache ──unlock──► EnvelopeDecryptor
//!                                        ▲
//!                   AutoReturnScheduler ─┘ status() / unlock()
//! ```

pub mod cache;
pub mod crypto;
pub mod key;

pub use cache::{ArmStatus, SessionKeyCache};
pub use crypto::{wallet_aad, AesGcmDecryptor, EnvelopeDecryptor};
pub use key::{KeyMaterial, WalletKey};
