//! # datashift
//!
//! Parallel bulk record transfer between pluggable storage backends.
//!
//! A run reads a source backend page by page and writes every page to a
//! target backend through a pool of workers:
//!
//! - **Pluggable backends** behind the async [`Backend`](crate::core::Backend) trait
//! - **Worker pool** with process or task isolation
//! - **Retries** for transient backend failures
//! - **Memory gate** that pauses a worker while its heap is over the limit
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datashift::{BackendCatalog, Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> datashift::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let catalog = Arc::new(BackendCatalog::with_builtins());
//!     let summary = Orchestrator::new(config, catalog)
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("Transferred {} records", summary.records_processed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use crate::core::{Backend, BackendCatalog, BackendFactory, Record};
pub use config::{Config, Isolation, TransferConfig};
pub use error::{Result, TransferError};
pub use orchestrator::{Orchestrator, RunStatus, RunSummary};
pub use worker::serve_stdio;
