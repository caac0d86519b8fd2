//! JSON-lines file driver.
//!
//! Each non-blank line is one JSON document. As a source the backend keeps
//! its own read cursor and re-opens the file only when asked to go
//! backwards, so a worker reading consecutive units streams the file once.
//! As a target every page is appended with a single write.
//!
//! Metadata is kept next to the data file in `<path>.meta.json`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::core::{
    Backend, BackendContext, BackendFactory, BackendInfo, Environment, Meta, Page, Record, Role,
    SourceStats, TargetStats,
};
use crate::error::{Result, TransferError};

use super::parse_options;

const DRIVER: &str = "file";

/// What the target does with existing file contents at reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Empty the file before the run.
    #[default]
    Truncate,
    /// Keep existing lines and append after them.
    Append,
}

#[derive(Debug, Clone, Deserialize)]
struct FileOptions {
    #[serde(default)]
    path: PathBuf,
    #[serde(default = "default_id_field")]
    id_field: String,
    #[serde(default)]
    mode: WriteMode,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// Factory for the `file` driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFactory;

impl BackendFactory for FileFactory {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: DRIVER.to_string(),
            name: "JSON Lines file".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Newline-delimited JSON documents on local disk".to_string(),
        }
    }

    fn create(&self, config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let options: FileOptions = parse_options(config)?;
        Ok(Box::new(FileBackend {
            info: self.info(),
            options,
            ctx,
            state: Mutex::new(FileState::default()),
        }))
    }
}

#[derive(Default)]
struct FileState {
    reader: Option<Lines<BufReader<File>>>,
    /// Documents consumed by `reader` so far.
    position: u64,
    writer: Option<File>,
}

/// Backend over one JSON-lines file.
pub struct FileBackend {
    info: BackendInfo,
    options: FileOptions,
    ctx: BackendContext,
    state: Mutex<FileState>,
}

impl FileBackend {
    fn meta_path(&self) -> PathBuf {
        let mut name = self.options.path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    fn io_error(&self, e: std::io::Error) -> TransferError {
        TransferError::backend(
            DRIVER,
            format!("{}: {}", self.options.path.display(), e),
        )
    }

    async fn open_reader(&self) -> Result<Lines<BufReader<File>>> {
        let file = File::open(&self.options.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(BufReader::new(file).lines())
    }

    async fn read_page(&self, state: &mut FileState, offset: u64, size: usize) -> Result<Page> {
        if state.reader.is_none() || state.position > offset {
            state.reader = Some(self.open_reader().await?);
            state.position = 0;
        }
        let Some(lines) = state.reader.as_mut() else {
            return Ok(Page::end());
        };

        while state.position < offset {
            if next_document(lines).await?.is_none() {
                return Ok(Page::end());
            }
            state.position += 1;
        }

        let mut records = Vec::with_capacity(size);
        while records.len() < size {
            let Some(line) = next_document(lines).await? else {
                return Ok(Page::new(records, true));
            };
            let body: Value = serde_json::from_str(&line).map_err(|e| {
                TransferError::fatal(
                    DRIVER,
                    format!("document {} is not valid JSON: {}", state.position, e),
                )
            })?;
            records.push(Record::from_document(
                body,
                &self.options.id_field,
                state.position,
            ));
            state.position += 1;
        }
        Ok(Page::new(records, false))
    }
}

/// Next non-blank line, or `None` at end of file.
async fn next_document(lines: &mut Lines<BufReader<File>>) -> std::io::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

#[async_trait]
impl Backend for FileBackend {
    fn get_info(&self) -> BackendInfo {
        self.info.clone()
    }

    fn verify_options(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.options.path.as_os_str().is_empty() {
            problems.push("file: 'path' is required".to_string());
        } else if self.ctx.role == Role::Source && !self.options.path.is_file() {
            problems.push(format!(
                "file: source '{}' does not exist",
                self.options.path.display()
            ));
        }
        if self.options.id_field.is_empty() {
            problems.push("file: 'id_field' must not be empty".to_string());
        }
        problems
    }

    async fn reset(&self, _env: &Environment) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = FileState::default();
        if self.ctx.role == Role::Target && self.options.mode == WriteMode::Truncate {
            File::create(&self.options.path)
                .await
                .map_err(|e| self.io_error(e))?;
            info!("Truncated target file {}", self.options.path.display());
        }
        Ok(())
    }

    async fn get_source_stats(&self, _env: &Environment) -> Result<SourceStats> {
        let mut lines = self.open_reader().await?;
        let mut count = 0u64;
        while next_document(&mut lines).await?.is_some() {
            count += 1;
        }
        Ok(SourceStats {
            version: self.info.version.clone(),
            status: "ok".to_string(),
            total_record_count: count,
        })
    }

    async fn get_target_stats(&self, _env: &Environment) -> Result<TargetStats> {
        let status = if self.options.path.exists() {
            "exists"
        } else {
            "new"
        };
        Ok(TargetStats {
            version: self.info.version.clone(),
            status: status.to_string(),
        })
    }

    async fn get_meta(&self, _env: &Environment) -> Result<Meta> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(json!({}));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn put_meta(&self, _env: &Environment, meta: &Meta) -> Result<()> {
        let content = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(self.meta_path(), content)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    async fn get_data(&self, _env: &Environment, offset: u64, size: usize) -> Result<Page> {
        let mut state = self.state.lock().await;
        let result = self.read_page(&mut state, offset, size).await;
        if result.is_err() {
            // The cursor position is unknown after a failed read.
            state.reader = None;
        }
        result
    }

    async fn put_data(&self, _env: &Environment, records: &[Record]) -> Result<u64> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, &record.body)?;
            buf.push(b'\n');
        }

        let mut state = self.state.lock().await;
        if state.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.options.path)
                .await
                .map_err(|e| self.io_error(e))?;
            state.writer = Some(file);
        }
        if let Some(writer) = state.writer.as_mut() {
            writer.write_all(&buf).await.map_err(|e| self.io_error(e))?;
            writer.flush().await.map_err(|e| self.io_error(e))?;
        }
        debug!(
            "file {:?}: appended {} records to {}",
            self.ctx.worker_id,
            records.len(),
            self.options.path.display()
        );
        Ok(records.len() as u64)
    }

    async fn end(&self, _env: &Environment) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(writer) = state.writer.take() {
            writer.sync_all().await.map_err(|e| self.io_error(e))?;
        }
        state.reader = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::Path;

    fn is_empty_file(path: &Path) -> bool {
        std::fs::read_to_string(path)
            .map(|s| s.lines().all(|l| l.trim().is_empty()))
            .unwrap_or(true)
    }

    fn env() -> Environment {
        Environment::new(Config::new(
            BackendConfig::new("file"),
            BackendConfig::new("file"),
        ))
    }

    fn backend(path: &Path, role: Role) -> Box<dyn Backend> {
        FileFactory
            .create(
                &BackendConfig::new("file").with_option("path", path.to_string_lossy().as_ref()),
                BackendContext::worker(role, 0),
            )
            .unwrap()
    }

    fn write_source(dir: &Path, count: usize) -> PathBuf {
        let path = dir.join("source.jsonl");
        let mut content = String::new();
        for i in 0..count {
            content.push_str(&format!("{{\"id\": \"r{}\", \"n\": {}}}\n", i, i));
            if i == 1 {
                content.push('\n');
            }
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_source_counts_documents_not_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(dir.path(), 5);
        let source = backend(&path, Role::Source);

        let stats = source.get_source_stats(&env()).await.unwrap();
        assert_eq!(stats.total_record_count, 5);
    }

    #[tokio::test]
    async fn test_source_pages_forward_and_backward() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(dir.path(), 5);
        let source = backend(&path, Role::Source);
        let env = env();

        let page = source.get_data(&env, 0, 2).await.unwrap();
        assert_eq!(page.records[0].id, "r0");
        assert!(!page.exhausted);

        let page = source.get_data(&env, 2, 2).await.unwrap();
        let ids: Vec<&str> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);

        let page = source.get_data(&env, 4, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(page.exhausted);

        // Going backwards re-opens the file.
        let page = source.get_data(&env, 1, 1).await.unwrap();
        assert_eq!(page.records[0].id, "r1");
    }

    #[tokio::test]
    async fn test_offset_past_end_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(dir.path(), 2);
        let source = backend(&path, Role::Source);

        let page = source.get_data(&env(), 10, 5).await.unwrap();
        assert!(page.is_empty());
        assert!(page.exhausted);
    }

    #[tokio::test]
    async fn test_invalid_json_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\": 1}\nnot json\n").unwrap();
        let source = backend(&path, Role::Source);

        let err = source.get_data(&env(), 0, 10).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_target_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "{\"old\": true}\n").unwrap();
        let target = backend(&path, Role::Target);
        let env = env();

        target.reset(&env).await.unwrap();
        assert!(is_empty_file(&path));

        let records = vec![
            Record::new("a", json!({"id": "a"})),
            Record::new("b", json!({"id": "b"})),
        ];
        assert_eq!(target.put_data(&env, &records).await.unwrap(), 2);
        assert_eq!(target.put_data(&env, &records[..1]).await.unwrap(), 1);
        target.end(&env).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_append_mode_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "{\"old\": true}\n").unwrap();
        let target = FileFactory
            .create(
                &BackendConfig::new("file")
                    .with_option("path", path.to_string_lossy().as_ref())
                    .with_option("mode", "append"),
                BackendContext::worker(Role::Target, 0),
            )
            .unwrap();

        target.reset(&env()).await.unwrap();
        assert!(!is_empty_file(&path));
    }

    #[tokio::test]
    async fn test_meta_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let target = backend(&path, Role::Target);
        let env = env();

        assert_eq!(target.get_meta(&env).await.unwrap(), json!({}));
        target.put_meta(&env, &json!({"v": 1})).await.unwrap();
        assert!(dir.path().join("out.jsonl.meta.json").exists());
        assert_eq!(target.get_meta(&env).await.unwrap(), json!({"v": 1}));
    }

    #[test]
    fn test_verify_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = backend(&dir.path().join("missing.jsonl"), Role::Source);
        assert_eq!(source.verify_options().len(), 1);

        let target = backend(&dir.path().join("missing.jsonl"), Role::Target);
        assert!(target.verify_options().is_empty());
    }
}
