//! Tracing subscriber setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::types::*;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> LedgerResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| LedgerError::Config(format!("failed to install logger: {}", e)))
}
