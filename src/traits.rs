//! Traits for storage abstraction and validation

use async_trait::async_trait;

use crate::types::*;

/// Query capability shared by every ledger accessor
///
/// Implemented once for an ambient accessor, where each call stands on its
/// own, and once for a transaction handle, where every call joins the open
/// transaction. Business logic is written against this trait so it runs
/// unchanged on either.
#[async_trait]
pub trait Querier: Send {
    /// Open a new account
    async fn create_account(&mut self, params: CreateAccountParams) -> LedgerResult<Account>;

    /// Get an account by ID
    async fn get_account(&mut self, id: i64) -> LedgerResult<Account>;

    /// Get an account by ID and hold its row lock until the transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> LedgerResult<Account>;

    /// List one owner's accounts ordered by ID
    async fn list_accounts(&mut self, params: ListAccountsParams) -> LedgerResult<Vec<Account>>;

    /// Atomically add a signed delta to an account balance
    ///
    /// The new balance is computed by the store under the row lock, never
    /// read and written back by the caller.
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> LedgerResult<Account>;

    /// Delete an account no entry or transfer refers to
    async fn delete_account(&mut self, id: i64) -> LedgerResult<()>;

    /// Append a ledger entry
    async fn create_entry(&mut self, params: CreateEntryParams) -> LedgerResult<Entry>;

    /// Get an entry by ID
    async fn get_entry(&mut self, id: i64) -> LedgerResult<Entry>;

    /// List one account's entries ordered by ID
    async fn list_entries(&mut self, params: ListEntriesParams) -> LedgerResult<Vec<Entry>>;

    /// Record a transfer
    async fn create_transfer(&mut self, params: CreateTransferParams) -> LedgerResult<Transfer>;

    /// Get a transfer by ID
    async fn get_transfer(&mut self, id: i64) -> LedgerResult<Transfer>;
}

/// An open storage transaction
///
/// Dropping a handle without calling [`TxHandle::commit`] must roll the
/// transaction back and release every lock it holds.
#[async_trait]
pub trait TxHandle: Querier + Sized {
    /// Make every write of the transaction visible at once
    async fn commit(self) -> LedgerResult<()>;

    /// Discard every write of the transaction
    async fn rollback(self) -> LedgerResult<()>;
}

/// Storage abstraction for the ledger system
///
/// Backends hand out an ambient accessor for one-off statements and
/// transaction handles for units of work that must be atomic.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Accessor whose calls are not grouped into a transaction
    type Conn: Querier;

    /// Transaction-scoped accessor
    type Tx: TxHandle;

    /// Get an ambient accessor
    fn conn(&self) -> Self::Conn;

    /// Begin a new transaction
    async fn begin(&self) -> LedgerResult<Self::Tx>;
}

/// Trait for implementing custom transfer validation rules
pub trait TransferValidator: Send + Sync {
    /// Validate a transfer request before any transaction is opened
    fn validate_transfer(&self, params: &TransferTxParams) -> LedgerResult<()>;
}

/// Trait for implementing custom account validation rules
pub trait AccountValidator: Send + Sync {
    /// Validate an account before it is created
    fn validate_account(&self, params: &CreateAccountParams) -> LedgerResult<()>;
}

/// Default transfer validator: positive amount between two distinct accounts
pub struct DefaultTransferValidator;

impl TransferValidator for DefaultTransferValidator {
    fn validate_transfer(&self, params: &TransferTxParams) -> LedgerResult<()> {
        crate::utils::validate_account_id(params.from_account_id)?;
        crate::utils::validate_account_id(params.to_account_id)?;
        crate::utils::validate_positive_amount(params.amount)?;

        if params.from_account_id == params.to_account_id {
            return Err(LedgerError::Validation(format!(
                "Cannot transfer from account {} to itself",
                params.from_account_id
            )));
        }

        Ok(())
    }
}

/// Default account validator with basic rules
pub struct DefaultAccountValidator;

impl AccountValidator for DefaultAccountValidator {
    fn validate_account(&self, params: &CreateAccountParams) -> LedgerResult<()> {
        crate::utils::validate_owner(&params.owner)
    }
}
