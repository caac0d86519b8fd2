//! Core abstractions for storage-agnostic record transfer.
//!
//! - [`record`]: Record, page and metadata types
//! - [`environment`]: Run environment handed to every worker
//! - [`traits`]: The backend capability contract
//! - [`catalog`]: Driver registry for dependency injection

pub mod catalog;
pub mod environment;
pub mod record;
pub mod traits;

pub use catalog::BackendCatalog;
pub use environment::{Environment, Statistics};
pub use record::{Meta, Page, Record};
pub use traits::{
    Backend, BackendContext, BackendFactory, BackendInfo, Role, SourceStats, TargetStats,
};
