//! Integration tests for bank-ledger

use async_trait::async_trait;
use bank_ledger::{
    utils::{MemoryStorage, MemoryTx},
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    Currency, Entry, Ledger, LedgerError, LedgerResult, LedgerStorage, ListAccountsParams,
    ListEntriesParams, Querier, Transfer, TransferTxParams, TxHandle,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn random_owner() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

fn random_money() -> i64 {
    rand::thread_rng().gen_range(100..=1000)
}

fn transfer(from: &Account, to: &Account, amount: i64) -> TransferTxParams {
    TransferTxParams {
        from_account_id: from.id,
        to_account_id: to.id,
        amount,
    }
}

async fn open_account<S: LedgerStorage + Clone>(ledger: &Ledger<S>, balance: i64) -> Account {
    ledger
        .create_account(random_owner(), Currency::Usd, balance)
        .await
        .unwrap()
}

/// Fails deadlocked tests instead of hanging them
async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out, transfers are probably deadlocked")
}

#[tokio::test]
async fn test_transfer_between_two_accounts() {
    let ledger = Ledger::new(MemoryStorage::new());
    let alice = open_account(&ledger, 100).await;
    let bob = open_account(&ledger, 50).await;

    let result = ledger.transfer_tx(transfer(&alice, &bob, 30)).await.unwrap();

    assert_eq!(result.transfer.from_account_id, alice.id);
    assert_eq!(result.transfer.to_account_id, bob.id);
    assert_eq!(result.transfer.amount, 30);

    assert_eq!(result.from_entry.account_id, alice.id);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.account_id, bob.id);
    assert_eq!(result.to_entry.amount, 30);

    assert_eq!(result.from_account.id, alice.id);
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.id, bob.id);
    assert_eq!(result.to_account.balance, 80);

    // Everything the result reports is persisted
    assert_eq!(ledger.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
    assert_eq!(ledger.get_entry(result.from_entry.id).await.unwrap(), result.from_entry);
    assert_eq!(ledger.get_entry(result.to_entry.id).await.unwrap(), result.to_entry);
    assert_eq!(ledger.get_account(alice.id).await.unwrap().balance, 70);
    assert_eq!(ledger.get_account(bob.id).await.unwrap().balance, 80);
}

#[tokio::test]
async fn test_transfer_from_higher_to_lower_id() {
    let ledger = Ledger::new(MemoryStorage::new());
    let low = open_account(&ledger, 100).await;
    let high = open_account(&ledger, 100).await;
    assert!(low.id < high.id);

    let result = ledger.transfer_tx(transfer(&high, &low, 40)).await.unwrap();

    assert_eq!(result.from_account.id, high.id);
    assert_eq!(result.from_account.balance, 60);
    assert_eq!(result.to_account.id, low.id);
    assert_eq!(result.to_account.balance, 140);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_same_direction() {
    let ledger = Ledger::new(MemoryStorage::new());
    let from = open_account(&ledger, random_money()).await;
    let to = open_account(&ledger, random_money()).await;
    let ledger = Arc::new(ledger);
    let amount = 10;
    let n = 5;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let ledger = ledger.clone();
            let params = transfer(&from, &to, amount);
            tokio::spawn(async move { ledger.transfer_tx(params).await })
        })
        .collect();

    let mut seen_steps = Vec::new();
    within(async {
        for handle in handles {
            let result = handle.await.unwrap().unwrap();

            // Each transfer observes a distinct prefix of the serialized history
            let diff_from = from.balance - result.from_account.balance;
            let diff_to = result.to_account.balance - to.balance;
            assert_eq!(diff_from, diff_to);
            assert!(diff_from > 0);
            assert_eq!(diff_from % amount, 0);

            let step = diff_from / amount;
            assert!((1..=n).contains(&step));
            assert!(!seen_steps.contains(&step));
            seen_steps.push(step);
        }
    })
    .await;

    let from_after = ledger.get_account(from.id).await.unwrap();
    let to_after = ledger.get_account(to.id).await.unwrap();
    assert_eq!(from_after.balance, from.balance - n * amount);
    assert_eq!(to_after.balance, to.balance + n * amount);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_opposite_directions() {
    let ledger = Ledger::new(MemoryStorage::new());
    let a = open_account(&ledger, random_money()).await;
    let b = open_account(&ledger, random_money()).await;
    let ledger = Arc::new(ledger);
    let amount = 10;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let ledger = ledger.clone();
            let params = if i % 2 == 0 {
                transfer(&a, &b, amount)
            } else {
                transfer(&b, &a, amount)
            };
            tokio::spawn(async move { ledger.transfer_tx(params).await })
        })
        .collect();

    within(async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await;

    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, a.balance);
    assert_eq!(ledger.get_account(b.id).await.unwrap().balance, b.balance);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_transfers_keep_ledger_consistent() {
    let ledger = Ledger::new(MemoryStorage::new());
    let mut accounts = Vec::new();
    for _ in 0..4 {
        accounts.push(open_account(&ledger, random_money()).await);
    }
    let ledger = Arc::new(ledger);

    let requests: Vec<TransferTxParams> = {
        let mut rng = rand::thread_rng();
        (0..40)
            .map(|_| {
                let from = rng.gen_range(0..accounts.len());
                let mut to = rng.gen_range(0..accounts.len() - 1);
                if to >= from {
                    to += 1;
                }
                transfer(&accounts[from], &accounts[to], rng.gen_range(1..=50))
            })
            .collect()
    };

    let handles: Vec<_> = requests
        .into_iter()
        .map(|params| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.transfer_tx(params).await })
        })
        .collect();

    within(async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await;

    let mut total_before = 0;
    let mut total_after = 0;
    for account in &accounts {
        let current = ledger.get_account(account.id).await.unwrap();
        let entries = ledger.list_entries(account.id, 100, 0).await.unwrap();
        let entry_sum: i64 = entries.iter().map(|e| e.amount).sum();

        assert_eq!(current.balance - account.balance, entry_sum);
        total_before += account.balance;
        total_after += current.balance;
    }
    assert_eq!(total_before, total_after);
}

#[tokio::test]
async fn test_transfers_are_not_idempotent() {
    let ledger = Ledger::new(MemoryStorage::new());
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 100).await;

    let first = ledger.transfer_tx(transfer(&a, &b, 10)).await.unwrap();
    let second = ledger.transfer_tx(transfer(&a, &b, 10)).await.unwrap();

    assert_ne!(first.transfer.id, second.transfer.id);
    assert_eq!(second.from_account.balance, 80);
    assert_eq!(second.to_account.balance, 120);
}

#[tokio::test]
async fn test_overdraft_is_allowed() {
    let ledger = Ledger::new(MemoryStorage::new());
    let a = open_account(&ledger, 10).await;
    let b = open_account(&ledger, 0).await;

    let result = ledger.transfer_tx(transfer(&a, &b, 25)).await.unwrap();

    assert_eq!(result.from_account.balance, -15);
    assert_eq!(result.to_account.balance, 25);
}

#[tokio::test]
async fn test_invalid_request_rejected_before_storage() {
    let storage = FaultyStorage::new(None, false);
    let ledger = Ledger::new(storage.clone());
    let a = open_account(&ledger, 100).await;

    for params in [
        transfer(&a, &a, 10),
        transfer(&a, &a, 0),
        TransferTxParams {
            from_account_id: a.id,
            to_account_id: a.id + 1,
            amount: -5,
        },
        TransferTxParams {
            from_account_id: 0,
            to_account_id: a.id,
            amount: 5,
        },
    ] {
        let err = ledger.transfer_tx(params).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)), "{:?}", err);
    }

    assert_eq!(storage.transactions_begun(), 0);
    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_missing_account_persists_nothing() {
    let ledger = Ledger::new(MemoryStorage::new());
    let a = open_account(&ledger, 100).await;

    let err = ledger
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: 999,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, LedgerError::ConstraintViolation(_)) || err.is_not_found(),
        "{:?}",
        err
    );

    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100);
    assert!(ledger.list_entries(a.id, 10, 0).await.unwrap().is_empty());

    // The failed transfer may have burned an ID; none was kept
    assert!(ledger.get_transfer(1).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failure_at_any_step_rolls_back_everything() {
    for fault in [
        Fault::CreateTransfer,
        Fault::FromEntry,
        Fault::ToEntry,
        Fault::FirstBalance,
        Fault::SecondBalance,
    ] {
        let storage = FaultyStorage::new(Some(fault), false);
        let ledger = Ledger::new(storage.clone());
        let a = open_account(&ledger, 100).await;
        let b = open_account(&ledger, 50).await;

        let err = ledger.transfer_tx(transfer(&a, &b, 30)).await.unwrap_err();
        assert!(
            matches!(err, LedgerError::Storage(ref msg) if msg.contains("injected")),
            "{:?}: {:?}",
            fault,
            err
        );

        assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100, "{:?}", fault);
        assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 50, "{:?}", fault);
        assert!(ledger.list_entries(a.id, 10, 0).await.unwrap().is_empty());
        assert!(ledger.list_entries(b.id, 10, 0).await.unwrap().is_empty());
        assert!(ledger.get_transfer(1).await.unwrap_err().is_not_found());

        // Locks were released: a clean transfer goes through right away
        storage.clear_fault();
        let result = within(ledger.transfer_tx(transfer(&a, &b, 30))).await.unwrap();
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
    }
}

#[tokio::test]
async fn test_rollback_failure_reports_both_errors() {
    let storage = FaultyStorage::new(Some(Fault::ToEntry), true);
    let ledger = Ledger::new(storage);
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 50).await;

    let err = ledger.transfer_tx(transfer(&a, &b, 30)).await.unwrap_err();

    match err {
        LedgerError::Rollback { source, rollback } => {
            assert!(matches!(*source, LedgerError::Storage(ref msg) if msg.contains("to entry")));
            assert!(matches!(*rollback, LedgerError::Transaction(_)));
        }
        other => panic!("expected rollback error, got {:?}", other),
    }

    // The handle was dropped without a successful rollback; nothing leaked
    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100);
    assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 50);
}

#[tokio::test]
async fn test_cancelled_transfer_leaves_no_trace() {
    let storage = MemoryStorage::new();
    let ledger = Ledger::new(storage.clone());
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 50).await;

    // Hold b's row lock so the transfer blocks on its second balance update
    let mut blocker = storage.begin().await.unwrap();
    blocker.get_account_for_update(b.id).await.unwrap();

    let err = ledger
        .transfer_tx_with_timeout(transfer(&a, &b, 30), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));

    blocker.rollback().await.unwrap();

    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100);
    assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 50);
    assert!(ledger.list_entries(a.id, 10, 0).await.unwrap().is_empty());

    // a's lock was released along with the abandoned transaction
    let result = within(ledger.transfer_tx(transfer(&a, &b, 30))).await.unwrap();
    assert_eq!(result.from_account.balance, 70);
}

#[tokio::test]
async fn test_configured_transfer_timeout() {
    let storage = MemoryStorage::new();
    let ledger =
        Ledger::new(storage.clone()).with_transfer_timeout(Some(Duration::from_millis(50)));
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 50).await;

    let mut blocker = storage.begin().await.unwrap();
    blocker.get_account_for_update(a.id).await.unwrap();

    let err = ledger.transfer_tx(transfer(&a, &b, 30)).await.unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    drop(blocker);

    let result = within(ledger.transfer_tx(transfer(&a, &b, 30))).await.unwrap();
    assert_eq!(result.to_account.balance, 80);
}

#[tokio::test]
async fn test_lock_timeout_surfaces_transaction_error() {
    let storage = MemoryStorage::with_lock_timeout(Some(Duration::from_millis(50)));
    let ledger = Ledger::new(storage.clone());
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 50).await;

    let mut blocker = storage.begin().await.unwrap();
    blocker.get_account_for_update(a.id).await.unwrap();

    let err = within(ledger.transfer_tx(transfer(&a, &b, 30))).await.unwrap_err();
    assert!(matches!(err, LedgerError::Transaction(_)), "{:?}", err);
    blocker.rollback().await.unwrap();

    assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 50);
}

#[tokio::test]
async fn test_account_with_history_cannot_be_deleted() {
    let ledger = Ledger::new(MemoryStorage::new());
    let a = open_account(&ledger, 100).await;
    let b = open_account(&ledger, 50).await;
    let idle = open_account(&ledger, 0).await;

    ledger.transfer_tx(transfer(&a, &b, 30)).await.unwrap();

    let err = ledger.delete_account(a.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ConstraintViolation(_)));

    ledger.delete_account(idle.id).await.unwrap();
    assert!(ledger.get_account(idle.id).await.unwrap_err().is_not_found());
}

// Storage wrapper that fails a chosen step of the transfer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    CreateTransfer,
    FromEntry,
    ToEntry,
    FirstBalance,
    SecondBalance,
}

#[derive(Clone)]
struct FaultyStorage {
    inner: MemoryStorage,
    fault: Arc<std::sync::Mutex<Option<Fault>>>,
    fail_rollback: bool,
    begun: Arc<std::sync::atomic::AtomicUsize>,
}

impl FaultyStorage {
    fn new(fault: Option<Fault>, fail_rollback: bool) -> Self {
        Self {
            inner: MemoryStorage::new(),
            fault: Arc::new(std::sync::Mutex::new(fault)),
            fail_rollback,
            begun: Default::default(),
        }
    }

    fn clear_fault(&self) {
        *self.fault.lock().unwrap() = None;
    }

    fn transactions_begun(&self) -> usize {
        self.begun.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStorage for FaultyStorage {
    type Conn = MemoryStorage;
    type Tx = FaultyTx;

    fn conn(&self) -> Self::Conn {
        self.inner.conn()
    }

    async fn begin(&self) -> LedgerResult<Self::Tx> {
        self.begun.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(FaultyTx {
            inner: self.inner.begin().await?,
            fault: *self.fault.lock().unwrap(),
            fail_rollback: self.fail_rollback,
            entries: 0,
            balances: 0,
        })
    }
}

struct FaultyTx {
    inner: MemoryTx,
    fault: Option<Fault>,
    fail_rollback: bool,
    entries: usize,
    balances: usize,
}

impl FaultyTx {
    fn trip(&self, step: Fault, what: &str) -> LedgerResult<()> {
        if self.fault == Some(step) {
            return Err(LedgerError::Storage(format!("injected failure at {}", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl Querier for FaultyTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> LedgerResult<Account> {
        self.inner.create_account(params).await
    }

    async fn get_account(&mut self, id: i64) -> LedgerResult<Account> {
        self.inner.get_account(id).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> LedgerResult<Account> {
        self.inner.get_account_for_update(id).await
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> LedgerResult<Vec<Account>> {
        self.inner.list_accounts(params).await
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> LedgerResult<Account> {
        self.balances += 1;
        if self.balances == 1 {
            self.trip(Fault::FirstBalance, "first balance update")?;
        } else {
            self.trip(Fault::SecondBalance, "second balance update")?;
        }
        self.inner.add_account_balance(params).await
    }

    async fn delete_account(&mut self, id: i64) -> LedgerResult<()> {
        self.inner.delete_account(id).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> LedgerResult<Entry> {
        self.entries += 1;
        if self.entries == 1 {
            self.trip(Fault::FromEntry, "from entry")?;
        } else {
            self.trip(Fault::ToEntry, "to entry")?;
        }
        self.inner.create_entry(params).await
    }

    async fn get_entry(&mut self, id: i64) -> LedgerResult<Entry> {
        self.inner.get_entry(id).await
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> LedgerResult<Vec<Entry>> {
        self.inner.list_entries(params).await
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> LedgerResult<Transfer> {
        self.trip(Fault::CreateTransfer, "create transfer")?;
        self.inner.create_transfer(params).await
    }

    async fn get_transfer(&mut self, id: i64) -> LedgerResult<Transfer> {
        self.inner.get_transfer(id).await
    }
}

#[async_trait]
impl TxHandle for FaultyTx {
    async fn commit(self) -> LedgerResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self) -> LedgerResult<()> {
        if self.fail_rollback {
            // inner is dropped here, which discards its writes
            return Err(LedgerError::Transaction("injected rollback failure".to_string()));
        }
        self.inner.rollback().await
    }
}
