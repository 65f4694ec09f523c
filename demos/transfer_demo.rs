//! Concurrent transfer example
//!
//! ```text
//! cargo run --example transfer_demo [config.yaml]
//! cargo run --example transfer_demo --features postgres app.yaml
//! ```

use bank_ledger::utils::MemoryStorage;
use bank_ledger::{init_logging, Config, Currency, Ledger, LedgerStorage, StorageKind, TransferTxParams};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default().with_overrides(|key| std::env::var(key).ok())?,
    };
    init_logging(&config.logging)?;

    match config.storage {
        StorageKind::Memory => {
            let storage = MemoryStorage::with_lock_timeout(config.lock_timeout());
            run(Ledger::new(storage).with_transfer_timeout(config.transfer_timeout())).await
        }
        #[cfg(feature = "postgres")]
        StorageKind::Postgres => {
            let url = config.database_url.as_deref().unwrap_or_default();
            let storage = bank_ledger::utils::PgStorage::connect(url, config.lock_timeout()).await?;
            storage.migrate().await?;
            run(Ledger::new(storage).with_transfer_timeout(config.transfer_timeout())).await
        }
        #[cfg(not(feature = "postgres"))]
        StorageKind::Postgres => Err("rebuild with --features postgres to use postgres".into()),
    }
}

async fn run<S>(ledger: Ledger<S>) -> Result<(), Box<dyn std::error::Error>>
where
    S: LedgerStorage + Clone + 'static,
{
    let suffix = chrono::Utc::now().timestamp_millis();
    let alice = ledger
        .create_account(format!("alice-{}", suffix), Currency::Usd, 1_000)
        .await?;
    let bob = ledger
        .create_account(format!("bob-{}", suffix), Currency::Usd, 1_000)
        .await?;
    println!("alice #{} = {}, bob #{} = {}", alice.id, alice.balance, bob.id, bob.balance);

    let ledger = Arc::new(ledger);
    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        let (from, to) = if i % 2 == 0 {
            (alice.id, bob.id)
        } else {
            (bob.id, alice.id)
        };
        handles.push(tokio::spawn(async move {
            ledger
                .transfer_tx(TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 10 + i,
                })
                .await
        }));
    }

    for handle in handles {
        let result = handle.await??;
        println!(
            "transfer #{}: {} -> {} ({})",
            result.transfer.id,
            result.transfer.from_account_id,
            result.transfer.to_account_id,
            result.transfer.amount
        );
    }

    let alice = ledger.get_account(alice.id).await?;
    let bob = ledger.get_account(bob.id).await?;
    println!("alice #{} = {}, bob #{} = {}", alice.id, alice.balance, bob.id, bob.balance);
    println!("total = {}", alice.balance + bob.balance);

    Ok(())
}
