//! Error types for armguard

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for armguard
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Session errors
    #[error("Wallet {wallet_id} of user {user_id} is not armed")]
    NotArmed { user_id: u64, wallet_id: u64 },

    #[error("Envelope decryption failed: {0}")]
    Decrypt(String),

    #[error("Invalid keypair: {0}")]
    InvalidKeypair(String),

    // Sweep errors
    #[error("Invalid sweep destination: {0}")]
    InvalidDestination(String),

    #[error("Transfer of {asset} failed: {reason}")]
    TransferFailure { asset: String, reason: String },

    #[error("Retry budget exhausted with {ms_left}ms left")]
    RetryBudgetExhausted { ms_left: u64 },

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction build failed: {0}")]
    TransactionBuild(String),

    // Storage errors
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Audit persist failed: {0}")]
    AuditPersist(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Notification errors
    #[error("Notification failed: {0}")]
    Notification(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::TransferFailure { .. } | Error::Storage(_)
        )
    }

    /// Check if this error means the wallet has no live session
    pub fn is_not_armed(&self) -> bool {
        matches!(self, Error::NotArmed { .. })
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
