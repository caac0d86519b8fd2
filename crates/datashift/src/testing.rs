//! Scripted backend for executor and coordinator tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{BackendConfig, Config};
use crate::core::{
    Backend, BackendCatalog, BackendContext, BackendFactory, BackendInfo, Environment, Meta, Page,
    Record, SourceStats, TargetStats,
};
use crate::error::{Result, TransferError};

#[derive(Default)]
pub(crate) struct ScriptState {
    pub total: u64,
    pub delay: Duration,
    pub fail_create: bool,
    pub get_failures: AtomicUsize,
    pub put_failures: AtomicUsize,
    pub fatal_get: AtomicBool,
    pub panics: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub end_calls: AtomicUsize,
    pub written: Mutex<Vec<Record>>,
    busy: Mutex<HashSet<usize>>,
    pub overlapped: AtomicBool,
}

/// Source of `total` synthetic records that also acts as a recording target.
#[derive(Clone)]
pub(crate) struct ScriptedFactory {
    pub state: Arc<ScriptState>,
}

impl ScriptedFactory {
    pub fn new(state: ScriptState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn catalog(&self) -> Arc<BackendCatalog> {
        let mut catalog = BackendCatalog::new();
        catalog.register("scripted", self.clone());
        Arc::new(catalog)
    }

    pub fn written_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        ids
    }
}

pub(crate) fn scripted(total: u64) -> ScriptState {
    ScriptState {
        total,
        ..Default::default()
    }
}

pub(crate) fn environment(records_expected: u64, max_retries: u32) -> Environment {
    let mut config = Config::new(
        BackendConfig::new("scripted"),
        BackendConfig::new("scripted"),
    );
    config.transfer.max_retries = Some(max_retries);
    let mut env = Environment::new(config);
    env.statistics.records_expected = records_expected;
    env
}

impl BackendFactory for ScriptedFactory {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            version: "0".to_string(),
            description: "test backend".to_string(),
        }
    }

    fn create(&self, _config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        if self.state.fail_create {
            return Err(TransferError::Config("scripted backend refused".to_string()));
        }
        Ok(Box::new(ScriptedBackend {
            state: self.state.clone(),
            worker: ctx.worker_id.unwrap_or(usize::MAX),
        }))
    }
}

struct ScriptedBackend {
    state: Arc<ScriptState>,
    worker: usize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn get_info(&self) -> BackendInfo {
        ScriptedFactory {
            state: self.state.clone(),
        }
        .info()
    }

    fn verify_options(&self) -> Vec<String> {
        Vec::new()
    }

    async fn reset(&self, _env: &Environment) -> Result<()> {
        Ok(())
    }

    async fn get_source_stats(&self, _env: &Environment) -> Result<SourceStats> {
        Ok(SourceStats {
            version: "0".to_string(),
            status: "ok".to_string(),
            total_record_count: self.state.total,
        })
    }

    async fn get_target_stats(&self, _env: &Environment) -> Result<TargetStats> {
        Ok(TargetStats {
            version: "0".to_string(),
            status: "ok".to_string(),
        })
    }

    async fn get_meta(&self, _env: &Environment) -> Result<Meta> {
        Ok(json!({}))
    }

    async fn put_meta(&self, _env: &Environment, _meta: &Meta) -> Result<()> {
        Ok(())
    }

    async fn get_data(&self, _env: &Environment, offset: u64, size: usize) -> Result<Page> {
        self.state.get_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.panics) {
            panic!("scripted worker crash");
        }
        if self.state.fatal_get.load(Ordering::SeqCst) {
            return Err(TransferError::fatal("scripted", "unreadable source"));
        }
        if take_failure(&self.state.get_failures) {
            return Err(TransferError::backend("scripted", "read timed out"));
        }
        if !self.state.busy.lock().unwrap().insert(self.worker) {
            self.state.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }
        self.state.busy.lock().unwrap().remove(&self.worker);

        let end = (offset + size as u64).min(self.state.total);
        let records = (offset.min(end)..end)
            .map(|i| Record::new(i.to_string(), json!({ "n": i })))
            .collect();
        Ok(Page::new(records, end >= self.state.total))
    }

    async fn put_data(&self, _env: &Environment, records: &[Record]) -> Result<u64> {
        self.state.put_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.put_failures) {
            return Err(TransferError::backend("scripted", "write timed out"));
        }
        self.state
            .written
            .lock()
            .unwrap()
            .extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn end(&self, _env: &Environment) -> Result<()> {
        self.state.end_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
