//! Validation utilities

use crate::types::*;

/// Largest page a list query may request
pub const MAX_PAGE_SIZE: i64 = 100;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: i64) -> LedgerResult<()> {
    if amount <= 0 {
        Err(LedgerError::Validation(format!(
            "Amount must be positive, got {}",
            amount
        )))
    } else {
        Ok(())
    }
}

/// Validate that an account ID could have been issued by the store
pub fn validate_account_id(account_id: i64) -> LedgerResult<()> {
    if account_id < 1 {
        return Err(LedgerError::Validation(format!(
            "Invalid account ID: {}",
            account_id
        )));
    }

    Ok(())
}

/// Validate that an account owner is valid
pub fn validate_owner(owner: &str) -> LedgerResult<()> {
    if owner.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Account owner cannot be empty".to_string(),
        ));
    }

    if owner.len() > 100 {
        return Err(LedgerError::Validation(
            "Account owner cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate limit/offset paging arguments
pub fn validate_page(limit: i64, offset: i64) -> LedgerResult<()> {
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(LedgerError::Validation(format!(
            "Page size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    if offset < 0 {
        return Err(LedgerError::Validation(
            "Page offset cannot be negative".to_string(),
        ));
    }

    Ok(())
}

/// Check whether a currency code is one accounts can be opened in
pub fn is_supported_currency(code: &str) -> bool {
    code.parse::<Currency>().is_ok()
}
