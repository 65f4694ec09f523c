//! Runs a unit of work inside a single storage transaction

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

use crate::traits::*;
use crate::types::*;

/// Execute `f` atomically against a fresh transaction
///
/// Commits when `f` succeeds. When it fails the transaction is rolled back
/// and the original error returned; if the rollback fails as well, both
/// errors come back together in [`LedgerError::Rollback`].
///
/// `f` must do all of its reads and writes through the handle it is given.
/// If `f` panics or the returned future is dropped, the handle goes out of
/// scope and the backend rolls the transaction back.
///
/// ```rust,ignore
/// let account = exec_tx(&storage, |tx| {
///     Box::pin(async move {
///         tx.add_account_balance(AddAccountBalanceParams { id: 1, amount: 10 }).await
///     })
/// })
/// .await?;
/// ```
pub async fn exec_tx<S, T, F>(storage: &S, f: F) -> LedgerResult<T>
where
    S: LedgerStorage,
    T: Send,
    F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, LedgerResult<T>> + Send,
{
    let mut tx = storage.begin().await?;
    debug!("transaction started");

    let outcome = f(&mut tx).await;

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            debug!("transaction committed");
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => {
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
            Err(rollback_err) => {
                warn!(error = %err, rollback_error = %rollback_err, "rollback failed");
                Err(LedgerError::Rollback {
                    source: Box::new(err),
                    rollback: Box::new(rollback_err),
                })
            }
        },
    }
}

/// Like [`exec_tx`], abandoning the transaction once `cancel` resolves
///
/// An abandoned transaction is rolled back and the call returns
/// [`LedgerError::Cancelled`]. A unit of work that finishes in the same poll
/// as the signal wins.
pub async fn exec_tx_until<S, T, F, C>(storage: &S, cancel: C, f: F) -> LedgerResult<T>
where
    S: LedgerStorage,
    T: Send,
    F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, LedgerResult<T>> + Send,
    C: Future<Output = ()> + Send,
{
    tokio::select! {
        biased;
        result = exec_tx(storage, f) => result,
        _ = cancel => {
            warn!("transaction cancelled before completion, rolling back");
            Err(LedgerError::Cancelled)
        }
    }
}
