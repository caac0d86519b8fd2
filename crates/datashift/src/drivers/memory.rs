//! In-process record stores.
//!
//! Stores are looked up by name in a [`MemoryStores`] registry owned by the
//! catalog, so a source and a target (or a test and a run) can share one.
//! A store lives in the process that created it: under process isolation
//! each worker process sees its own, seeded from the `records` option.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::BackendConfig;
use crate::core::{
    Backend, BackendContext, BackendFactory, BackendInfo, Environment, Meta, Page, Record,
    SourceStats, TargetStats,
};
use crate::error::Result;

use super::parse_options;

const DRIVER: &str = "memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Named stores shared between backend instances.
#[derive(Debug, Clone, Default)]
pub struct MemoryStores {
    inner: Arc<Mutex<HashMap<String, Arc<MemoryStore>>>>,
}

impl MemoryStores {
    /// Get the store called `name`, creating it empty if needed.
    pub fn store(&self, name: &str) -> Arc<MemoryStore> {
        lock(&self.inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<Record>,
    positions: HashMap<String, usize>,
    meta: Option<Meta>,
}

/// An ordered, id-keyed record store.
///
/// Inserting a record whose id is already present overwrites it in place,
/// which keeps retried writes from duplicating records.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl StoreState {
    fn upsert(&mut self, record: Record) {
        match self.positions.get(&record.id).copied() {
            Some(pos) => self.records[pos] = record,
            None => {
                self.positions.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

impl MemoryStore {
    /// Insert or overwrite records, returning how many were applied.
    pub fn upsert(&self, records: impl IntoIterator<Item = Record>) -> u64 {
        let mut state = lock(&self.state);
        let mut applied = 0;
        for record in records {
            state.upsert(record);
            applied += 1;
        }
        applied
    }

    /// Seed the store from documents unless it already holds records.
    fn seed(&self, documents: &[Value], id_field: &str) {
        let mut state = lock(&self.state);
        if !state.records.is_empty() {
            return;
        }
        for (i, doc) in documents.iter().enumerate() {
            state.upsert(Record::from_document(doc.clone(), id_field, i as u64));
        }
    }

    /// Snapshot of all records in insertion order.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.state).records.clone()
    }

    /// Records in `[offset, offset + size)`.
    pub fn slice(&self, offset: u64, size: usize) -> Page {
        let state = lock(&self.state);
        let len = state.records.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size).min(len);
        Page::new(state.records[start..end].to_vec(), end >= len)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata last written to this store.
    pub fn meta(&self) -> Option<Meta> {
        lock(&self.state).meta.clone()
    }

    pub fn set_meta(&self, meta: Meta) {
        lock(&self.state).meta = Some(meta);
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MemoryOptions {
    #[serde(default)]
    store: String,
    #[serde(default = "default_id_field")]
    id_field: String,
    #[serde(default)]
    records: Vec<Value>,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// Factory for the `memory` driver.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    stores: MemoryStores,
}

impl MemoryFactory {
    pub fn new(stores: MemoryStores) -> Self {
        Self { stores }
    }
}

impl BackendFactory for MemoryFactory {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: DRIVER.to_string(),
            name: "Memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "In-process record store shared by name".to_string(),
        }
    }

    fn create(&self, config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let options: MemoryOptions = parse_options(config)?;
        let store = self.stores.store(&options.store);
        if !options.records.is_empty() {
            store.seed(&options.records, &options.id_field);
        }
        Ok(Box::new(MemoryBackend {
            info: self.info(),
            options,
            store,
            ctx,
        }))
    }
}

/// Backend over a [`MemoryStore`].
pub struct MemoryBackend {
    info: BackendInfo,
    options: MemoryOptions,
    store: Arc<MemoryStore>,
    ctx: BackendContext,
}

#[async_trait]
impl Backend for MemoryBackend {
    fn get_info(&self) -> BackendInfo {
        self.info.clone()
    }

    fn verify_options(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.options.store.is_empty() {
            problems.push("memory: 'store' must name a store".to_string());
        }
        if self.options.id_field.is_empty() {
            problems.push("memory: 'id_field' must not be empty".to_string());
        }
        problems
    }

    async fn reset(&self, _env: &Environment) -> Result<()> {
        Ok(())
    }

    async fn get_source_stats(&self, _env: &Environment) -> Result<SourceStats> {
        Ok(SourceStats {
            version: self.info.version.clone(),
            status: "ok".to_string(),
            total_record_count: self.store.len() as u64,
        })
    }

    async fn get_target_stats(&self, _env: &Environment) -> Result<TargetStats> {
        Ok(TargetStats {
            version: self.info.version.clone(),
            status: "ok".to_string(),
        })
    }

    async fn get_meta(&self, _env: &Environment) -> Result<Meta> {
        Ok(self.store.meta().unwrap_or_else(|| json!({})))
    }

    async fn put_meta(&self, _env: &Environment, meta: &Meta) -> Result<()> {
        self.store.set_meta(meta.clone());
        Ok(())
    }

    async fn get_data(&self, _env: &Environment, offset: u64, size: usize) -> Result<Page> {
        let page = self.store.slice(offset, size);
        debug!(
            "memory[{}] {:?}: read {} records at {}",
            self.options.store,
            self.ctx.worker_id,
            page.len(),
            offset
        );
        Ok(page)
    }

    async fn put_data(&self, _env: &Environment, records: &[Record]) -> Result<u64> {
        Ok(self.store.upsert(records.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::Role;

    fn env() -> Environment {
        Environment::new(Config::new(
            BackendConfig::new("memory"),
            BackendConfig::new("memory"),
        ))
    }

    fn records(range: std::ops::Range<u64>) -> Vec<Record> {
        range
            .map(|i| Record::new(i.to_string(), json!({ "n": i })))
            .collect()
    }

    #[test]
    fn test_upsert_overwrites_by_id() {
        let store = MemoryStore::default();
        store.upsert(records(0..3));
        store.upsert(vec![Record::new("1", json!({"n": 100}))]);

        let all = store.records();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].body, json!({"n": 100}));
    }

    #[test]
    fn test_slice_marks_exhaustion() {
        let store = MemoryStore::default();
        store.upsert(records(0..5));

        let page = store.slice(0, 2);
        assert_eq!(page.len(), 2);
        assert!(!page.exhausted);

        let page = store.slice(4, 2);
        assert_eq!(page.len(), 1);
        assert!(page.exhausted);

        let page = store.slice(10, 2);
        assert!(page.is_empty());
        assert!(page.exhausted);
    }

    #[test]
    fn test_stores_shared_by_name() {
        let stores = MemoryStores::default();
        stores.store("a").upsert(records(0..2));
        assert_eq!(stores.store("a").len(), 2);
        assert!(stores.store("b").is_empty());
    }

    #[tokio::test]
    async fn test_backend_reads_and_writes() {
        let stores = MemoryStores::default();
        stores.store("src").upsert(records(0..4));
        let factory = MemoryFactory::new(stores.clone());

        let source = factory
            .create(
                &BackendConfig::new("memory").with_option("store", "src"),
                BackendContext::worker(Role::Source, 0),
            )
            .unwrap();
        let target = factory
            .create(
                &BackendConfig::new("memory").with_option("store", "dst"),
                BackendContext::worker(Role::Target, 0),
            )
            .unwrap();

        let env = env();
        assert_eq!(
            source.get_source_stats(&env).await.unwrap().total_record_count,
            4
        );
        let page = source.get_data(&env, 1, 2).await.unwrap();
        assert_eq!(target.put_data(&env, &page.records).await.unwrap(), 2);

        let ids: Vec<String> = stores.store("dst").records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_seed_from_options() {
        let stores = MemoryStores::default();
        let factory = MemoryFactory::new(stores.clone());
        let config = BackendConfig::new("memory")
            .with_option("store", "seeded")
            .with_option("records", json!([{"id": "x"}, {"id": "y"}]));

        factory
            .create(&config, BackendContext::coordinator(Role::Source))
            .unwrap();
        // A second instance must not seed twice.
        factory
            .create(&config, BackendContext::worker(Role::Source, 0))
            .unwrap();

        assert_eq!(stores.store("seeded").len(), 2);
    }

    #[test]
    fn test_verify_requires_store_name() {
        let factory = MemoryFactory::default();
        let backend = factory
            .create(
                &BackendConfig::new("memory"),
                BackendContext::coordinator(Role::Target),
            )
            .unwrap();
        assert_eq!(backend.verify_options().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let factory = MemoryFactory::default();
        let backend = factory
            .create(
                &BackendConfig::new("memory").with_option("store", "m"),
                BackendContext::coordinator(Role::Target),
            )
            .unwrap();
        let env = env();
        assert_eq!(backend.get_meta(&env).await.unwrap(), json!({}));
        backend.put_meta(&env, &json!({"fields": ["n"]})).await.unwrap();
        assert_eq!(backend.get_meta(&env).await.unwrap(), json!({"fields": ["n"]}));
    }
}
