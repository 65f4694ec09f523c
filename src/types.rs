//! Core types and data structures for the ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currencies an account can be opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// US Dollar
    Usd,
    /// Euro
    Eur,
    /// British Pound
    Gbp,
    /// Indian Rupee
    Inr,
}

impl Currency {
    /// Every supported currency, in declaration order
    pub const ALL: [Currency; 4] = [Currency::Usd, Currency::Eur, Currency::Gbp, Currency::Inr];

    /// ISO 4217 code of the currency
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Inr => "INR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::ALL
            .into_iter()
            .find(|c| c.code() == s)
            .ok_or_else(|| LedgerError::Validation(format!("Unsupported currency: {}", s)))
    }
}

/// A customer account holding a balance in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Identity assigned by the store
    pub id: i64,
    /// Name of the account holder
    pub owner: String,
    /// Current balance; may be negative, no overdraft check is applied
    pub balance: i64,
    /// Currency the balance is denominated in
    pub currency: Currency,
    /// When the account was opened
    pub created_at: DateTime<Utc>,
}

/// One signed ledger line: positive is a credit, negative a debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one movement of funds between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Arguments for opening an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// Page through one owner's accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

/// Signed delta applied to an account balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

/// Page through the entries of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Request for a money transfer between two accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Everything a successful transfer wrote, accounts as of after the update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Errors that can occur in the ledger system
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Account not found: {0}")]
    AccountNotFound(i64),
    #[error("Entry not found: {0}")]
    EntryNotFound(i64),
    #[error("Transfer not found: {0}")]
    TransferNotFound(i64),
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Transaction cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    /// The unit of work failed and the rollback that followed failed too
    #[error("Transaction error: {source}, rollback error: {rollback}")]
    Rollback {
        source: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },
}

impl LedgerError {
    /// True for any of the not-found variants
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_)
                | LedgerError::EntryNotFound(_)
                | LedgerError::TransferNotFound(_)
        )
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
