//! In-memory transactional storage for testing and development
//!
//! Behaves like a small row-locking database:
//!
//! - Every account row carries its own lock. A transaction takes it on the
//!   first write to the row (or [`Querier::get_account_for_update`]) and
//!   keeps it until it commits or is dropped.
//! - Writes stay private to the transaction until commit, when foreign keys
//!   and unique constraints are checked and everything is published at once.
//!   Other readers only ever see committed rows.
//! - Dropping an unfinished transaction discards its writes and releases its
//!   locks, which is the rollback.
//! - IDs come from sequences that are not rolled back, so aborted inserts
//!   leave gaps.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ledger::exec_tx;
use crate::traits::*;
use crate::types::*;

#[derive(Debug)]
struct AccountRow {
    account: Account,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<i64, AccountRow>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

impl Tables {
    fn is_referenced(&self, account_id: i64) -> bool {
        self.entries.values().any(|e| e.account_id == account_id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == account_id || t.to_account_id == account_id)
    }
}

#[derive(Debug)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
}

impl Sequences {
    fn new() -> Self {
        Self {
            accounts: AtomicI64::new(1),
            entries: AtomicI64::new(1),
            transfers: AtomicI64::new(1),
        }
    }

    fn next(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Inner {
    tables: RwLock<Tables>,
    sequences: Sequences,
    lock_timeout: Option<Duration>,
}

impl Inner {
    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| LedgerError::Storage("table lock poisoned".to_string()))
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| LedgerError::Storage("table lock poisoned".to_string()))
    }
}

/// In-memory storage implementation for testing and development
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    /// Create a new memory storage instance whose lock waits never time out
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// Create a memory storage instance that fails lock waits longer than
    /// `lock_timeout` with [`LedgerError::Transaction`]
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(Tables::default()),
                sequences: Sequences::new(),
                lock_timeout,
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    type Conn = MemoryStorage;
    type Tx = MemoryTx;

    fn conn(&self) -> Self::Conn {
        self.clone()
    }

    async fn begin(&self) -> LedgerResult<Self::Tx> {
        Ok(MemoryTx::new(self.inner.clone()))
    }
}

/// Each ambient call runs as its own single-statement transaction.
#[async_trait]
impl Querier for MemoryStorage {
    async fn create_account(&mut self, params: CreateAccountParams) -> LedgerResult<Account> {
        exec_tx(&*self, move |tx| tx.create_account(params)).await
    }

    async fn get_account(&mut self, id: i64) -> LedgerResult<Account> {
        exec_tx(&*self, move |tx| tx.get_account(id)).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> LedgerResult<Account> {
        exec_tx(&*self, move |tx| tx.get_account_for_update(id)).await
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> LedgerResult<Vec<Account>> {
        exec_tx(&*self, move |tx| tx.list_accounts(params)).await
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> LedgerResult<Account> {
        exec_tx(&*self, move |tx| tx.add_account_balance(params)).await
    }

    async fn delete_account(&mut self, id: i64) -> LedgerResult<()> {
        exec_tx(&*self, move |tx| tx.delete_account(id)).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> LedgerResult<Entry> {
        exec_tx(&*self, move |tx| tx.create_entry(params)).await
    }

    async fn get_entry(&mut self, id: i64) -> LedgerResult<Entry> {
        exec_tx(&*self, move |tx| tx.get_entry(id)).await
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> LedgerResult<Vec<Entry>> {
        exec_tx(&*self, move |tx| tx.list_entries(params)).await
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> LedgerResult<Transfer> {
        exec_tx(&*self, move |tx| tx.create_transfer(params)).await
    }

    async fn get_transfer(&mut self, id: i64) -> LedgerResult<Transfer> {
        exec_tx(&*self, move |tx| tx.get_transfer(id)).await
    }
}

/// Open transaction on a [`MemoryStorage`]
pub struct MemoryTx {
    inner: Arc<Inner>,
    row_locks: HashMap<i64, OwnedMutexGuard<()>>,
    /// New or updated account rows, keyed by ID
    accounts: BTreeMap<i64, Account>,
    created_accounts: BTreeSet<i64>,
    deleted_accounts: BTreeSet<i64>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    finished: bool,
}

impl MemoryTx {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            row_locks: HashMap::new(),
            accounts: BTreeMap::new(),
            created_accounts: BTreeSet::new(),
            deleted_accounts: BTreeSet::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
            finished: false,
        }
    }

    fn has_writes(&self) -> bool {
        !(self.accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.entries.is_empty()
            && self.transfers.is_empty())
    }

    /// The account as this transaction sees it
    fn visible_account(&self, id: i64) -> LedgerResult<Option<Account>> {
        if self.deleted_accounts.contains(&id) {
            return Ok(None);
        }
        if let Some(account) = self.accounts.get(&id) {
            return Ok(Some(account.clone()));
        }
        let tables = self.inner.read()?;
        Ok(tables.accounts.get(&id).map(|row| row.account.clone()))
    }

    fn require_account(&self, id: i64) -> LedgerResult<Account> {
        self.visible_account(id)?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    fn check_account_reference(&self, table: &str, account_id: i64) -> LedgerResult<()> {
        if self.visible_account(account_id)?.is_none() {
            return Err(LedgerError::ConstraintViolation(format!(
                "insert into {} references missing account {}",
                table, account_id
            )));
        }
        Ok(())
    }

    fn check_owner_currency_unique(
        &self,
        tables: &Tables,
        id: i64,
        owner: &str,
        currency: Currency,
    ) -> LedgerResult<()> {
        let committed = tables
            .accounts
            .values()
            .map(|row| &row.account)
            .filter(|a| !self.deleted_accounts.contains(&a.id) && !self.accounts.contains_key(&a.id));
        let duplicate = committed
            .chain(self.accounts.values())
            .any(|a| a.id != id && a.owner == owner && a.currency == currency);

        if duplicate {
            return Err(LedgerError::ConstraintViolation(format!(
                "owner {} already has a {} account",
                owner, currency
            )));
        }
        Ok(())
    }

    /// Take the row lock of an account, waiting if another transaction holds it
    async fn lock_row(&mut self, id: i64) -> LedgerResult<()> {
        if self.row_locks.contains_key(&id) || self.created_accounts.contains(&id) {
            return Ok(());
        }

        let lock = {
            let tables = self.inner.read()?;
            match tables.accounts.get(&id) {
                Some(row) => row.lock.clone(),
                None => return Err(LedgerError::AccountNotFound(id)),
            }
        };

        let guard = match self.inner.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    LedgerError::Transaction(format!(
                        "lock timeout after {:?} waiting for account {}",
                        timeout, id
                    ))
                })?,
            None => lock.lock_owned().await,
        };
        self.row_locks.insert(id, guard);

        // The row may have been deleted while we were waiting for it.
        let still_exists = {
            let tables = self.inner.read()?;
            tables.accounts.contains_key(&id)
        };
        if !still_exists {
            return Err(LedgerError::AccountNotFound(id));
        }

        tracing::trace!(account_id = id, "row lock acquired");
        Ok(())
    }

    fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
        let offset = usize::try_from(offset).unwrap_or(0);
        let limit = usize::try_from(limit).unwrap_or(0);
        rows.skip(offset).take(limit).collect()
    }

    /// Re-check every constraint against the latest committed state
    fn validate_commit(&self, tables: &Tables) -> LedgerResult<()> {
        let exists_after = |id: i64| {
            !self.deleted_accounts.contains(&id)
                && (self.created_accounts.contains(&id) || tables.accounts.contains_key(&id))
        };

        for entry in self.entries.values() {
            if !exists_after(entry.account_id) {
                return Err(LedgerError::ConstraintViolation(format!(
                    "entry {} references missing account {}",
                    entry.id, entry.account_id
                )));
            }
        }

        for transfer in self.transfers.values() {
            for account_id in [transfer.from_account_id, transfer.to_account_id] {
                if !exists_after(account_id) {
                    return Err(LedgerError::ConstraintViolation(format!(
                        "transfer {} references missing account {}",
                        transfer.id, account_id
                    )));
                }
            }
        }

        for &id in &self.deleted_accounts {
            let pending_reference = self.entries.values().any(|e| e.account_id == id)
                || self
                    .transfers
                    .values()
                    .any(|t| t.from_account_id == id || t.to_account_id == id);
            if pending_reference || tables.is_referenced(id) {
                return Err(LedgerError::ConstraintViolation(format!(
                    "account {} is still referenced by entries or transfers",
                    id
                )));
            }
        }

        for &id in &self.created_accounts {
            if let Some(account) = self.accounts.get(&id) {
                self.check_owner_currency_unique(tables, id, &account.owner, account.currency)?;
            }
        }

        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished && self.has_writes() {
            tracing::debug!("memory transaction dropped before commit, discarding writes");
        }
    }
}

#[async_trait]
impl Querier for MemoryTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> LedgerResult<Account> {
        let id = Sequences::next(&self.inner.sequences.accounts);
        {
            let tables = self.inner.read()?;
            self.check_owner_currency_unique(&tables, id, &params.owner, params.currency)?;
        }

        let account = Account {
            id,
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(id, account.clone());
        self.created_accounts.insert(id);

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> LedgerResult<Account> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: i64) -> LedgerResult<Account> {
        if self.deleted_accounts.contains(&id) {
            return Err(LedgerError::AccountNotFound(id));
        }
        self.lock_row(id).await?;
        self.require_account(id)
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> LedgerResult<Vec<Account>> {
        let mut visible: BTreeMap<i64, Account> = {
            let tables = self.inner.read()?;
            tables
                .accounts
                .values()
                .filter(|row| row.account.owner == params.owner)
                .map(|row| (row.account.id, row.account.clone()))
                .collect()
        };
        for (id, account) in &self.accounts {
            if account.owner == params.owner {
                visible.insert(*id, account.clone());
            } else {
                visible.remove(id);
            }
        }
        for id in &self.deleted_accounts {
            visible.remove(id);
        }

        Ok(Self::page(visible.into_values(), params.limit, params.offset))
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> LedgerResult<Account> {
        if self.deleted_accounts.contains(&params.id) {
            return Err(LedgerError::AccountNotFound(params.id));
        }
        self.lock_row(params.id).await?;

        let mut account = self.require_account(params.id)?;
        account.balance = account.balance.checked_add(params.amount).ok_or_else(|| {
            LedgerError::ConstraintViolation(format!(
                "balance of account {} out of range",
                params.id
            ))
        })?;
        self.accounts.insert(params.id, account.clone());

        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> LedgerResult<()> {
        if self.deleted_accounts.contains(&id) {
            return Err(LedgerError::AccountNotFound(id));
        }
        self.lock_row(id).await?;
        self.require_account(id)?;

        let referenced = {
            let tables = self.inner.read()?;
            tables.is_referenced(id)
        } || self.entries.values().any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if referenced {
            return Err(LedgerError::ConstraintViolation(format!(
                "account {} is still referenced by entries or transfers",
                id
            )));
        }

        self.accounts.remove(&id);
        if !self.created_accounts.remove(&id) {
            self.deleted_accounts.insert(id);
        }
        Ok(())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> LedgerResult<Entry> {
        self.check_account_reference("entries", params.account_id)?;

        let entry = Entry {
            id: Sequences::next(&self.inner.sequences.entries),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());

        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> LedgerResult<Entry> {
        if let Some(entry) = self.entries.get(&id) {
            return Ok(entry.clone());
        }
        let tables = self.inner.read()?;
        tables
            .entries
            .get(&id)
            .cloned()
            .ok_or(LedgerError::EntryNotFound(id))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> LedgerResult<Vec<Entry>> {
        let mut visible: BTreeMap<i64, Entry> = {
            let tables = self.inner.read()?;
            tables
                .entries
                .values()
                .filter(|e| e.account_id == params.account_id)
                .map(|e| (e.id, e.clone()))
                .collect()
        };
        visible.extend(
            self.entries
                .values()
                .filter(|e| e.account_id == params.account_id)
                .map(|e| (e.id, e.clone())),
        );

        Ok(Self::page(visible.into_values(), params.limit, params.offset))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> LedgerResult<Transfer> {
        if params.amount <= 0 {
            return Err(LedgerError::ConstraintViolation(format!(
                "transfer amount must be positive, got {}",
                params.amount
            )));
        }
        self.check_account_reference("transfers", params.from_account_id)?;
        self.check_account_reference("transfers", params.to_account_id)?;

        let transfer = Transfer {
            id: Sequences::next(&self.inner.sequences.transfers),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());

        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> LedgerResult<Transfer> {
        if let Some(transfer) = self.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        let tables = self.inner.read()?;
        tables
            .transfers
            .get(&id)
            .cloned()
            .ok_or(LedgerError::TransferNotFound(id))
    }
}

#[async_trait]
impl TxHandle for MemoryTx {
    async fn commit(mut self) -> LedgerResult<()> {
        self.finished = true;

        {
            let mut tables = self.inner.write()?;
            self.validate_commit(&tables)?;

            for id in &self.deleted_accounts {
                tables.accounts.remove(id);
            }
            for (id, account) in std::mem::take(&mut self.accounts) {
                if self.created_accounts.contains(&id) {
                    tables.accounts.insert(
                        id,
                        AccountRow {
                            account,
                            lock: Arc::new(Mutex::new(())),
                        },
                    );
                } else if let Some(row) = tables.accounts.get_mut(&id) {
                    row.account = account;
                }
            }
            tables.entries.append(&mut self.entries);
            tables.transfers.append(&mut self.transfers);
        }

        // Row locks are released when `self` is dropped, after publication.
        tracing::trace!(locks = self.row_locks.len(), "memory transaction committed");
        Ok(())
    }

    async fn rollback(mut self) -> LedgerResult<()> {
        self.finished = true;
        tracing::trace!(locks = self.row_locks.len(), "memory transaction rolled back");
        Ok(())
    }
}
