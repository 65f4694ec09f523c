//! Main ledger orchestrator that coordinates accounts and transfers

use std::future::Future;
use std::time::Duration;

use crate::ledger::{AccountManager, TransferManager};
use crate::traits::*;
use crate::types::*;

/// Main ledger system that orchestrates accounts and transfers
pub struct Ledger<S: LedgerStorage> {
    account_manager: AccountManager<S>,
    transfer_manager: TransferManager<S>,
}

impl<S: LedgerStorage + Clone> Ledger<S> {
    /// Create a new ledger with the given storage backend
    pub fn new(storage: S) -> Self {
        Self {
            account_manager: AccountManager::new(storage.clone()),
            transfer_manager: TransferManager::new(storage),
        }
    }

    /// Create a new ledger with custom validators
    pub fn with_validators(
        storage: S,
        account_validator: Box<dyn AccountValidator>,
        transfer_validator: Box<dyn TransferValidator>,
    ) -> Self {
        Self {
            account_manager: AccountManager::with_validator(storage.clone(), account_validator),
            transfer_manager: TransferManager::with_validator(storage, transfer_validator),
        }
    }
}

impl<S: LedgerStorage> Ledger<S> {
    /// Bound every transfer by a deadline, `None` to wait indefinitely
    pub fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_manager = self.transfer_manager.with_timeout(timeout);
        self
    }

    /// The storage backend, for running custom units of work with
    /// [`exec_tx`](crate::ledger::exec_tx)
    pub fn storage(&self) -> &S {
        &self.transfer_manager.storage
    }

    // Account operations
    /// Open a new account
    pub async fn create_account(
        &self,
        owner: String,
        currency: Currency,
        opening_balance: i64,
    ) -> LedgerResult<Account> {
        self.account_manager
            .create_account(owner, currency, opening_balance)
            .await
    }

    /// Get an account by ID
    pub async fn get_account(&self, account_id: i64) -> LedgerResult<Account> {
        self.account_manager.get_account(account_id).await
    }

    /// List one owner's accounts
    pub async fn list_accounts(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Account>> {
        self.account_manager.list_accounts(owner, limit, offset).await
    }

    /// Adjust a balance without writing an entry
    pub async fn add_account_balance(&self, account_id: i64, amount: i64) -> LedgerResult<Account> {
        self.account_manager
            .add_account_balance(account_id, amount)
            .await
    }

    /// Delete an account that nothing references
    pub async fn delete_account(&self, account_id: i64) -> LedgerResult<()> {
        self.account_manager.delete_account(account_id).await
    }

    // Transfer operations
    /// Move funds between two accounts atomically
    pub async fn transfer_tx(&self, params: TransferTxParams) -> LedgerResult<TransferTxResult> {
        self.transfer_manager.transfer_tx(params).await
    }

    /// Transfer with an explicit deadline
    pub async fn transfer_tx_with_timeout(
        &self,
        params: TransferTxParams,
        timeout: Duration,
    ) -> LedgerResult<TransferTxResult> {
        self.transfer_manager
            .transfer_tx_with_timeout(params, timeout)
            .await
    }

    /// Transfer that is abandoned and rolled back when `cancel` resolves
    pub async fn transfer_tx_until<C>(
        &self,
        params: TransferTxParams,
        cancel: C,
    ) -> LedgerResult<TransferTxResult>
    where
        C: Future<Output = ()> + Send,
    {
        self.transfer_manager.transfer_tx_until(params, cancel).await
    }

    /// Get a transfer by ID
    pub async fn get_transfer(&self, transfer_id: i64) -> LedgerResult<Transfer> {
        self.transfer_manager.get_transfer(transfer_id).await
    }

    /// Get an entry by ID
    pub async fn get_entry(&self, entry_id: i64) -> LedgerResult<Entry> {
        self.transfer_manager.get_entry(entry_id).await
    }

    /// List the entries of an account
    pub async fn list_entries(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Entry>> {
        self.transfer_manager
            .list_entries(account_id, limit, offset)
            .await
    }
}
