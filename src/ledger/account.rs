//! Account management functionality

use crate::traits::*;
use crate::types::*;
use crate::utils::{validate_account_id, validate_page};

/// Account manager for opening, reading and closing accounts
pub struct AccountManager<S: LedgerStorage> {
    pub(crate) storage: S,
    validator: Box<dyn AccountValidator>,
}

impl<S: LedgerStorage> AccountManager<S> {
    /// Create a new account manager
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            validator: Box::new(DefaultAccountValidator),
        }
    }

    /// Create a new account manager with custom validator
    pub fn with_validator(storage: S, validator: Box<dyn AccountValidator>) -> Self {
        Self { storage, validator }
    }

    /// Open a new account
    ///
    /// An owner holds at most one account per currency.
    pub async fn create_account(
        &self,
        owner: String,
        currency: Currency,
        opening_balance: i64,
    ) -> LedgerResult<Account> {
        let params = CreateAccountParams {
            owner,
            balance: opening_balance,
            currency,
        };

        self.validator.validate_account(&params)?;

        let account = self.storage.conn().create_account(params).await?;
        tracing::info!(
            account_id = account.id,
            owner = %account.owner,
            currency = %account.currency,
            "account opened"
        );

        Ok(account)
    }

    /// Get an account by ID
    pub async fn get_account(&self, account_id: i64) -> LedgerResult<Account> {
        validate_account_id(account_id)?;
        self.storage.conn().get_account(account_id).await
    }

    /// List one owner's accounts, one page at a time
    pub async fn list_accounts(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Account>> {
        validate_page(limit, offset)?;

        self.storage
            .conn()
            .list_accounts(ListAccountsParams {
                owner: owner.to_string(),
                limit,
                offset,
            })
            .await
    }

    /// Adjust a balance outside of any transfer
    ///
    /// No entry is written, so this is only meant for administrative
    /// corrections and seeding.
    pub async fn add_account_balance(&self, account_id: i64, amount: i64) -> LedgerResult<Account> {
        validate_account_id(account_id)?;

        self.storage
            .conn()
            .add_account_balance(AddAccountBalanceParams {
                id: account_id,
                amount,
            })
            .await
    }

    /// Delete an account
    ///
    /// Fails with a constraint violation while entries or transfers still
    /// reference it.
    pub async fn delete_account(&self, account_id: i64) -> LedgerResult<()> {
        validate_account_id(account_id)?;

        let mut conn = self.storage.conn();
        // Ensure the account exists
        conn.get_account(account_id).await?;
        conn.delete_account(account_id).await?;

        tracing::info!(account_id, "account deleted");
        Ok(())
    }
}
