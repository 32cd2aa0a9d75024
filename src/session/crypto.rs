//! Envelope decryption contract
//!
//! Wallet signing keys are stored encrypted under a per-wallet DEK. The DEK
//! only lives in the session cache while the wallet is armed; decryption
//! binds the call to the owning user and wallet through the AAD.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

use super::key::WalletKey;

/// AES-GCM nonce length prefixed to every envelope
pub const NONCE_LEN: usize = 12;

/// Decrypts a wallet key envelope
pub trait EnvelopeDecryptor: Send + Sync {
    fn decrypt(&self, envelope: &[u8], dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// Additional authenticated data for a wallet's key envelope
pub fn wallet_aad(wallet: WalletKey) -> String {
    format!("armguard:user:{}:wallet:{}", wallet.user_id, wallet.wallet_id)
}

/// AES-256-GCM envelopes laid out as `nonce || ciphertext || tag`
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmDecryptor;

impl EnvelopeDecryptor for AesGcmDecryptor {
    fn decrypt(&self, envelope: &[u8], dek: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if envelope.len() <= NONCE_LEN {
            return Err(Error::Decrypt(format!(
                "envelope too short: {} bytes",
                envelope.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(dek)
            .map_err(|_| Error::Decrypt(format!("DEK must be 32 bytes, got {}", dek.len())))?;

        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Decrypt("authentication failed".to_string()))?;

        Ok(Zeroizing::new(plain))
    }
}
