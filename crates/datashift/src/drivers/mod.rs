//! Built-in backend drivers.
//!
//! - [`memory`]: In-process record stores, shared by name
//! - [`file`]: JSON-lines files on local disk
//! - [`postgres`]: A PostgreSQL table of `(key text, doc jsonb)` rows
//!
//! # Adding New Backends
//!
//! 1. Create a module under `drivers/` with a `Backend` implementation
//! 2. Add a `BackendFactory` that parses the driver options
//! 3. Register the factory in `BackendCatalog::with_memory_stores()`

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileFactory;
pub use memory::{MemoryFactory, MemoryStore, MemoryStores};
pub use postgres::PostgresFactory;

use serde::de::DeserializeOwned;

use crate::config::BackendConfig;
use crate::error::{Result, TransferError};

/// Deserialize a driver's options map into its typed options struct.
pub(crate) fn parse_options<T: DeserializeOwned>(config: &BackendConfig) -> Result<T> {
    serde_json::from_value(config.options_value()).map_err(|e| {
        TransferError::Config(format!("invalid '{}' options: {}", config.driver, e))
    })
}
