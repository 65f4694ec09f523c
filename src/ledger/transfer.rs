//! Money transfers between accounts

use std::future::Future;
use std::time::Duration;
use tracing::instrument;

use crate::ledger::executor::exec_tx_until;
use crate::traits::*;
use crate::types::*;

/// Transfer manager executing transfers as single storage transactions
pub struct TransferManager<S: LedgerStorage> {
    pub(crate) storage: S,
    validator: Box<dyn TransferValidator>,
    timeout: Option<Duration>,
}

impl<S: LedgerStorage> TransferManager<S> {
    /// Create a new transfer manager
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            validator: Box::new(DefaultTransferValidator),
            timeout: None,
        }
    }

    /// Create a new transfer manager with custom validator
    pub fn with_validator(storage: S, validator: Box<dyn TransferValidator>) -> Self {
        Self {
            storage,
            validator,
            timeout: None,
        }
    }

    /// Bound every transfer by a deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Move `amount` from one account to another
    ///
    /// Writes the transfer, both entries and both balance changes in one
    /// transaction; on any error none of them is kept. Not idempotent: every
    /// call records a new transfer.
    #[instrument(
        skip(self),
        fields(
            from = params.from_account_id,
            to = params.to_account_id,
            amount = params.amount
        ),
        err
    )]
    pub async fn transfer_tx(&self, params: TransferTxParams) -> LedgerResult<TransferTxResult> {
        match self.timeout {
            Some(timeout) => self.transfer_tx_with_timeout(params, timeout).await,
            None => {
                self.transfer_tx_until(params, std::future::pending())
                    .await
            }
        }
    }

    /// Transfer, giving up and rolling back if it has not finished in `timeout`
    pub async fn transfer_tx_with_timeout(
        &self,
        params: TransferTxParams,
        timeout: Duration,
    ) -> LedgerResult<TransferTxResult> {
        self.transfer_tx_until(params, tokio::time::sleep(timeout))
            .await
    }

    /// Transfer, giving up and rolling back as soon as `cancel` resolves
    pub async fn transfer_tx_until<C>(
        &self,
        params: TransferTxParams,
        cancel: C,
    ) -> LedgerResult<TransferTxResult>
    where
        C: Future<Output = ()> + Send,
    {
        self.validator.validate_transfer(&params)?;

        exec_tx_until(&self.storage, cancel, move |tx| {
            Box::pin(execute_transfer(tx, params))
        })
        .await
    }

    /// Get a transfer by ID
    pub async fn get_transfer(&self, transfer_id: i64) -> LedgerResult<Transfer> {
        self.storage.conn().get_transfer(transfer_id).await
    }

    /// Get an entry by ID
    pub async fn get_entry(&self, entry_id: i64) -> LedgerResult<Entry> {
        self.storage.conn().get_entry(entry_id).await
    }

    /// List the entries of an account
    pub async fn list_entries(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Entry>> {
        crate::utils::validate_account_id(account_id)?;
        crate::utils::validate_page(limit, offset)?;

        self.storage
            .conn()
            .list_entries(ListEntriesParams {
                account_id,
                limit,
                offset,
            })
            .await
    }
}

/// The writes of one transfer, run against whatever accessor is given
///
/// Only atomic when `q` is a transaction handle.
pub async fn execute_transfer<Q>(q: &mut Q, params: TransferTxParams) -> LedgerResult<TransferTxResult>
where
    Q: Querier + ?Sized,
{
    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: params.from_account_id,
            amount: -params.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: params.to_account_id,
            amount: params.amount,
        })
        .await?;

    // Row locks are always taken lower account ID first so that transfers
    // in opposite directions over the same pair cannot wait on each other.
    let (from_account, to_account) = if params.from_account_id < params.to_account_id {
        add_money(
            q,
            params.from_account_id,
            -params.amount,
            params.to_account_id,
            params.amount,
        )
        .await?
    } else {
        let (to_account, from_account) = add_money(
            q,
            params.to_account_id,
            params.amount,
            params.from_account_id,
            -params.amount,
        )
        .await?;
        (from_account, to_account)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

async fn add_money<Q>(
    q: &mut Q,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> LedgerResult<(Account, Account)>
where
    Q: Querier + ?Sized,
{
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;

    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;

    Ok((account1, account2))
}
