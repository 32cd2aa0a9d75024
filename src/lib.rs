//! armguard library
//!
//! Time-boxed arming of custodial hot-wallet signing keys for unattended
//! automation, with a pre-expiry sweep of free funds to cold storage and a
//! hash-chained audit trail.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod guardian;
pub mod session;
pub mod sweep;
pub mod timer;
pub mod wallet;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use guardian::Guardian;
pub use session::SessionKeyCache;
pub use sweep::AutoReturnScheduler;
