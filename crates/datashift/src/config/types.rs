//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend records are read from.
    pub source: BackendConfig,

    /// Backend records are written to.
    pub target: BackendConfig,

    /// Transfer behavior configuration.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Worker memory gate configuration.
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Config {
    /// Create a config with default transfer and memory settings.
    pub fn new(source: BackendConfig, target: BackendConfig) -> Self {
        Self {
            source,
            target,
            transfer: TransferConfig::default(),
            memory: MemoryConfig::default(),
        }
    }

    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }
}

/// Driver selection plus driver-specific options.
///
/// Everything except `driver` is handed to the backend untouched, so each
/// driver owns the shape of its own options:
///
/// ```yaml
/// source:
///   driver: file
///   path: ./records.jsonl
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Registered driver name (e.g. "file", "postgres", "memory").
    pub driver: String,

    /// Driver-specific options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl BackendConfig {
    /// Create a backend config with no options.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            options: Map::new(),
        }
    }

    /// Add an option, builder style.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Options as a JSON object, for typed deserialization by drivers.
    pub fn options_value(&self) -> Value {
        Value::Object(self.options.clone())
    }
}

/// How pool workers are isolated from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Child processes speaking the worker protocol over stdin/stdout.
    #[default]
    Process,

    /// Independent tokio tasks connected to the coordinator by channels.
    Task,
}

/// Transfer behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Number of pool workers. Below 2 runs a single in-process executor.
    /// Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Records per work unit. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Attempts per fetch/store before a work unit fails (0 = single attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Count failed work units as zero records and keep going (default: false).
    #[serde(default)]
    pub ignore_errors: bool,

    /// Copy source metadata to the target before data (default: true).
    #[serde(default = "default_true")]
    pub transfer_meta: bool,

    /// Stop after this many records even if the source holds more.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,

    /// Worker isolation mode (default: process).
    #[serde(default)]
    pub isolation: Isolation,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: None,
            page_size: None,
            max_retries: None,
            ignore_errors: false,
            transfer_meta: true,
            max_records: None,
            isolation: Isolation::default(),
        }
    }
}

impl TransferConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: leave one core for the coordinator, 1-16 range
        if self.workers.is_none() {
            self.workers = Some(cores.saturating_sub(1).clamp(1, 16));
        }

        // Page size: 1000 base, +500 per 8GB of RAM, cap at 10K
        if self.page_size.is_none() {
            let page = 1_000 + (ram_gb / 8.0) as usize * 500;
            self.page_size = Some(page.clamp(1_000, 10_000));
        }

        info!(
            "Auto-tuned config: workers={}, page_size={}, max_retries={}",
            self.get_workers(),
            self.get_page_size(),
            self.get_max_retries(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(1)
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(1_000)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }
}

/// Memory pressure gate configuration for workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Utilization ratio at which a worker stalls before fetching (default: 0.9).
    #[serde(default = "default_memory_limit")]
    pub limit: f64,

    /// Per-worker memory budget. System memory is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_budget_mb: Option<u64>,

    /// Base sampling interval the adaptive check delay scales from (default: 50).
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Pause between reclamation and the next check (default: 100).
    #[serde(default = "default_reclaim_delay_ms")]
    pub reclaim_delay_ms: u64,

    /// Stall under pressure until it subsides instead of proceeding (default: false).
    #[serde(default)]
    pub wait_for_capacity: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit: default_memory_limit(),
            heap_budget_mb: None,
            check_interval_ms: default_check_interval_ms(),
            reclaim_delay_ms: default_reclaim_delay_ms(),
            wait_for_capacity: false,
        }
    }
}

impl MemoryConfig {
    /// Budget in bytes, if configured.
    pub fn heap_budget_bytes(&self) -> Option<u64> {
        self.heap_budget_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_memory_limit() -> f64 {
    0.9
}

fn default_check_interval_ms() -> u64 {
    50
}

fn default_reclaim_delay_ms() -> u64 {
    100
}
