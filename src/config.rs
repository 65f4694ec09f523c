//! Service configuration
//!
//! Read from a YAML file; selected environment variables take precedence
//! over the file so deployments can override secrets and tuning knobs.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::*;

/// Which storage backend the ledger runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `bank_ledger=debug`
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageKind,
    /// Connection string, required for the postgres backend
    pub database_url: Option<String>,
    /// Longest a transaction waits for a row lock
    pub lock_timeout_ms: Option<u64>,
    /// Deadline applied to every transfer
    pub transfer_timeout_ms: Option<u64>,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&content)?
            .with_overrides(|key| std::env::var(key).ok())
            .and_then(Self::validated)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> LedgerResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| LedgerError::Config(format!("invalid config: {}", e)))
    }

    /// Apply `DATABASE_URL`, `LOG_LEVEL`, `LOCK_TIMEOUT_MS` and
    /// `TRANSFER_TIMEOUT_MS` as returned by `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> LedgerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(ms) = lookup("LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = Some(parse_millis("LOCK_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = lookup("TRANSFER_TIMEOUT_MS") {
            self.transfer_timeout_ms = Some(parse_millis("TRANSFER_TIMEOUT_MS", &ms)?);
        }
        Ok(self)
    }

    fn validated(self) -> LedgerResult<Self> {
        if self.storage == StorageKind::Postgres && self.database_url.is_none() {
            return Err(LedgerError::Config(
                "database_url is required for the postgres backend".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_millis(key: &str, value: &str) -> LedgerResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("{} must be a number of milliseconds", key)))
}
