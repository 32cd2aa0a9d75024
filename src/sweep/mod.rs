//! Fund return
//!
//! Free balance computation, the ordered sweep, and the scheduler that runs
//! a sweep shortly before an armed session expires.
//!
//! # Architecture
//!
//! ```text
//! AutoReturnScheduler
//!   ├─ BalanceProvider + ReservationSource ─► FreeBalanceCalculator ─► FreeBalanceSnapshot
//!   ├─ SessionKeyCache::unlock ─► signing Keypair
//!   └─ SweepExecutor ─► TransferProvider (others → stables → SOL)
//! ```

pub mod auto_return;
pub mod balance;
pub mod executor;
pub mod rpc;

pub use auto_return::{
    AutoReturnOverrides, AutoReturnScheduler, RecentTriggerRecord, SweepPorts, TriggerOutcome,
};
pub use balance::{
    BalanceProvider, FreeAsset, FreeBalanceCalculator, FreeBalanceSnapshot, MemoryReservations,
    ReservationSource, Reservations, TokenBalance, WalletBalances, WrappedNative,
};
pub use executor::{
    validate_destination, PlannedTransfer, SweepAsset, SweepExecutor, SweepPolicy, SweepReport,
    TransferProvider,
};
pub use rpc::{rpc_client, RpcBalanceProvider, RpcTransferProvider};
