//! Driver catalog for explicit dependency injection.
//!
//! The [`BackendCatalog`] maps driver names to backend factories. It is
//! explicitly constructed and handed to the orchestrator and to every
//! worker, rather than living in global state.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut catalog = BackendCatalog::with_builtins();
//! catalog.register("s3", S3Factory::new());
//! let orchestrator = Orchestrator::new(config, Arc::new(catalog));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::drivers::{FileFactory, MemoryFactory, MemoryStores, PostgresFactory};
use crate::error::{Result, TransferError};

use super::traits::{Backend, BackendContext, BackendFactory, BackendInfo};

/// Registry of backend factories keyed by driver name.
#[derive(Default, Clone)]
pub struct BackendCatalog {
    factories: BTreeMap<String, Arc<dyn BackendFactory>>,
}

impl BackendCatalog {
    /// Create a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog with the built-in `memory`, `file` and `postgres`
    /// drivers registered.
    pub fn with_builtins() -> Self {
        Self::with_memory_stores(MemoryStores::default())
    }

    /// Like [`with_builtins`](Self::with_builtins), sharing the given
    /// in-memory stores with the caller.
    pub fn with_memory_stores(stores: MemoryStores) -> Self {
        let mut catalog = Self::new();
        catalog.register("memory", MemoryFactory::new(stores));
        catalog.register("file", FileFactory);
        catalog.register("postgres", PostgresFactory);
        catalog
    }

    /// Register (or replace) a driver.
    pub fn register(&mut self, name: impl Into<String>, factory: impl BackendFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether a driver is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create a backend instance for `config`.
    pub fn create(&self, config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let factory = self
            .factories
            .get(&config.driver)
            .ok_or_else(|| TransferError::UnknownDriver(config.driver.clone()))?;
        factory.create(config, ctx)
    }

    /// Info for every registered driver, sorted by name.
    pub fn drivers(&self) -> Vec<BackendInfo> {
        self.factories.values().map(|f| f.info()).collect()
    }
}
