//! # Bank Ledger
//!
//! A ledger-backed account service built around an atomic money transfer
//! engine.
//!
//! ## Features
//!
//! - **Atomic transfers**: the transfer record, both ledger entries and both
//!   balance changes commit together or not at all
//! - **Deadlock-free locking**: account rows are always locked lower ID first
//! - **Storage abstraction**: business logic is written once against the
//!   [`Querier`] trait and runs on an ambient connection or a transaction
//! - **Backends**: a row-locking in-memory engine, and PostgreSQL behind the
//!   `postgres` feature
//! - **Cancellation**: deadlines and cancel signals roll the transaction back
//!
//! ## Quick Start
//!
//! ```rust
//! use bank_ledger::utils::MemoryStorage;
//! use bank_ledger::{Currency, Ledger, TransferTxParams};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), bank_ledger::LedgerError> {
//! let ledger = Ledger::new(MemoryStorage::new());
//! let alice = ledger.create_account("alice".to_string(), Currency::Usd, 100).await?;
//! let bob = ledger.create_account("bob".to_string(), Currency::Usd, 50).await?;
//!
//! let result = ledger
//!     .transfer_tx(TransferTxParams {
//!         from_account_id: alice.id,
//!         to_account_id: bob.id,
//!         amount: 30,
//!     })
//!     .await?;
//! assert_eq!(result.from_account.balance, 70);
//! assert_eq!(result.to_account.balance, 80);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ledger;
pub mod logging;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::*;
pub use ledger::*;
pub use logging::init_logging;
pub use traits::*;
pub use types::*;
