//! Backend capability contract.
//!
//! Every storage plugin implements [`Backend`]. The worker executor and the
//! orchestrator only ever talk to storage through this trait.
//!
//! # Instances
//!
//! Backends are created per role and per worker by a [`BackendFactory`]
//! (see [`catalog`](super::catalog)). Cursors, connections and write buffers
//! are fields of the instance, never module state, so two workers (or two
//! runs) cannot observe each other's progress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::Result;

use super::environment::Environment;
use super::record::{Meta, Page, Record};

/// Descriptive information about a backend driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Stable driver identifier (the catalog key).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Driver version.
    pub version: String,
    /// One-line description.
    pub description: String,
}

/// Source-side statistics reported before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Backend/server version string.
    pub version: String,
    /// Backend status (e.g. "ok").
    pub status: String,
    /// Records available for transfer.
    pub total_record_count: u64,
}

/// Target-side statistics reported before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    /// Backend/server version string.
    pub version: String,
    /// Backend status (e.g. "ok").
    pub status: String,
}

/// Which side of the transfer a backend instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Target,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Target => write!(f, "target"),
        }
    }
}

/// Per-instance context injected when a backend is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendContext {
    /// Role this instance serves.
    pub role: Role,
    /// Owning worker, or `None` for the coordinating side.
    pub worker_id: Option<usize>,
}

impl BackendContext {
    /// Context for the coordinating (orchestrator) side.
    pub fn coordinator(role: Role) -> Self {
        Self {
            role,
            worker_id: None,
        }
    }

    /// Context for a pool worker.
    pub fn worker(role: Role, worker_id: usize) -> Self {
        Self {
            role,
            worker_id: Some(worker_id),
        }
    }
}

/// Uniform operation set every storage plugin implements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Describe this backend.
    fn get_info(&self) -> BackendInfo;

    /// Validate the options this instance was built from.
    ///
    /// Returns one message per problem; empty means valid.
    fn verify_options(&self) -> Vec<String>;

    /// Reinitialize instance-local state (cursors, cached counts) between runs.
    async fn reset(&self, env: &Environment) -> Result<()>;

    /// Report source statistics, including the total record count.
    async fn get_source_stats(&self, env: &Environment) -> Result<SourceStats>;

    /// Report target statistics.
    async fn get_target_stats(&self, env: &Environment) -> Result<TargetStats>;

    /// Read schema/settings metadata.
    async fn get_meta(&self, env: &Environment) -> Result<Meta>;

    /// Apply schema/settings metadata ahead of data.
    async fn put_meta(&self, env: &Environment, meta: &Meta) -> Result<()>;

    /// Fetch the records in `[offset, offset + size)`.
    ///
    /// `offset` and `size` are pagination hints. A backend without native
    /// pagination may ignore them and self-paginate with a cursor.
    async fn get_data(&self, env: &Environment, offset: u64, size: usize) -> Result<Page>;

    /// Store a page of records, returning how many were written.
    ///
    /// Retries may resend records an earlier attempt already wrote, so this
    /// must tolerate duplicates (idempotent or overwrite semantics).
    async fn put_data(&self, env: &Environment, records: &[Record]) -> Result<u64>;

    /// Optional hook run once per worker before its first work unit.
    async fn prepare(&self, _env: &Environment) -> Result<()> {
        Ok(())
    }

    /// Optional finalize/flush hook run once after the worker's last unit.
    async fn end(&self, _env: &Environment) -> Result<()> {
        Ok(())
    }
}

/// Creates backend instances for one driver.
pub trait BackendFactory: Send + Sync {
    /// Describe the driver without instantiating it.
    fn info(&self) -> BackendInfo;

    /// Build a backend instance from its config.
    ///
    /// Option parsing failures are reported here; semantic checks belong
    /// in [`Backend::verify_options`]. Connections are opened lazily.
    fn create(&self, config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>>;
}
