//! Ledger module containing account management and the transfer engine

pub mod account;
pub mod core;
pub mod executor;
pub mod transfer;

pub use account::*;
pub use self::core::*;
pub use executor::*;
pub use transfer::*;
