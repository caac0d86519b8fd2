//! Configuration validation.

use super::Config;
use crate::error::{Result, TransferError};

/// Validate the configuration.
///
/// Driver-specific options are checked later by each backend's
/// `verify_options`; this only covers the engine's own settings.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.driver.trim().is_empty() {
        return Err(TransferError::Config("source.driver is required".into()));
    }
    if config.target.driver.trim().is_empty() {
        return Err(TransferError::Config("target.driver is required".into()));
    }

    // Only check performance settings if explicitly set
    if let Some(0) = config.transfer.workers {
        return Err(TransferError::Config(
            "transfer.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.transfer.page_size {
        return Err(TransferError::Config(
            "transfer.page_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.transfer.max_records {
        return Err(TransferError::Config(
            "transfer.max_records must be at least 1".into(),
        ));
    }

    let limit = config.memory.limit;
    if !(limit > 0.0 && limit <= 1.0) {
        return Err(TransferError::Config(format!(
            "memory.limit must be in (0, 1], got {}",
            limit
        )));
    }
    if config.memory.check_interval_ms == 0 {
        return Err(TransferError::Config(
            "memory.check_interval_ms must be at least 1".into(),
        ));
    }
    if let Some(0) = config.memory.heap_budget_mb {
        return Err(TransferError::Config(
            "memory.heap_budget_mb must be at least 1".into(),
        ));
    }

    Ok(())
}
