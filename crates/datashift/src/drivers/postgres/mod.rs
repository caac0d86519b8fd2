//! PostgreSQL driver.
//!
//! Records live in one table with a text key column and a jsonb document
//! column:
//!
//! ```sql
//! CREATE TABLE public.records (id text PRIMARY KEY, doc jsonb NOT NULL);
//! ```
//!
//! Each backend instance owns a single-connection deadpool pool, so every
//! worker gets its own connection, opened on first use and recycled after
//! a connection failure. Reads page by `ORDER BY key OFFSET .. LIMIT ..`.
//! Writes are `UNNEST` upserts keyed on the record id, which makes a retried
//! page overwrite rather than duplicate.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::core::{
    Backend, BackendContext, BackendFactory, BackendInfo, Environment, Meta, Page, Record,
    SourceStats, TargetStats,
};
use crate::error::{Result, TransferError};

use super::parse_options;

const DRIVER: &str = "postgres";

/// Connect timeout for the per-instance connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
struct PostgresOptions {
    /// libpq-style connection string or URL.
    #[serde(default)]
    connection: String,
    #[serde(default = "default_schema")]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default = "default_key_column")]
    key_column: String,
    #[serde(default = "default_data_column")]
    data_column: String,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_data_column() -> String {
    "doc".to_string()
}

/// Quote a PostgreSQL identifier.
fn quote_pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualify a PostgreSQL table name with schema and proper quoting.
fn qualify_pg_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_pg_ident(schema), quote_pg_ident(table))
}

/// Classify a server error: statement and data errors repeat on every
/// attempt, connection-level errors may not.
fn pg_error(e: tokio_postgres::Error) -> TransferError {
    let fatal_class = e
        .code()
        .map(|state| {
            let code = state.code();
            ["22", "23", "28", "42"]
                .iter()
                .any(|class| code.starts_with(class))
        })
        .unwrap_or(false);
    if fatal_class {
        TransferError::fatal(DRIVER, e.to_string())
    } else {
        TransferError::Postgres(e)
    }
}

/// Factory for the `postgres` driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresFactory;

impl BackendFactory for PostgresFactory {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: DRIVER.to_string(),
            name: "PostgreSQL".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Key/jsonb document table in PostgreSQL".to_string(),
        }
    }

    fn create(&self, config: &BackendConfig, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let options: PostgresOptions = parse_options(config)?;

        let mut pg_config: PgConfig = if options.connection.is_empty() {
            PgConfig::new()
        } else {
            options
                .connection
                .parse()
                .map_err(|e| TransferError::Config(format!("postgres connection: {}", e)))?
        };
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(1)
            .build()
            .map_err(|e| TransferError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        Ok(Box::new(PostgresBackend {
            info: self.info(),
            table: qualify_pg_table(&options.schema, &options.table),
            key: quote_pg_ident(&options.key_column),
            data: quote_pg_ident(&options.data_column),
            options,
            ctx,
            pool,
        }))
    }
}

/// Backend over one PostgreSQL table.
pub struct PostgresBackend {
    info: BackendInfo,
    options: PostgresOptions,
    ctx: BackendContext,
    pool: Pool,
    table: String,
    key: String,
    data: String,
}

impl PostgresBackend {
    async fn client(&self) -> Result<Object> {
        let first = self.pool.status().size == 0;
        let client = self.pool.get().await.map_err(|e| {
            TransferError::backend(DRIVER, format!("getting connection: {}", e))
        })?;
        if first {
            info!(
                "Connected to PostgreSQL {} for {} (worker {:?})",
                self.table, self.ctx.role, self.ctx.worker_id
            );
        }
        Ok(client)
    }

    async fn server_version(&self, client: &Object) -> Result<String> {
        let row = client
            .query_one("SHOW server_version", &[])
            .await
            .map_err(pg_error)?;
        row.try_get(0).map_err(pg_error)
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn get_info(&self) -> BackendInfo {
        self.info.clone()
    }

    fn verify_options(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.options.connection.is_empty() {
            problems.push("postgres: 'connection' is required".to_string());
        }
        if self.options.table.is_empty() {
            problems.push("postgres: 'table' is required".to_string());
        }
        if self.options.key_column == self.options.data_column {
            problems.push("postgres: 'key_column' and 'data_column' must differ".to_string());
        }
        if self
            .options
            .connection
            .to_lowercase()
            .contains("sslmode=require")
        {
            warn!("postgres: TLS is not supported, 'sslmode=require' will fail to connect");
        }
        problems
    }

    async fn reset(&self, _env: &Environment) -> Result<()> {
        Ok(())
    }

    async fn get_source_stats(&self, _env: &Environment) -> Result<SourceStats> {
        let client = self.client().await?;
        let version = self.server_version(&client).await?;
        let sql = format!("SELECT count(*) FROM {}", self.table);
        let row = client.query_one(sql.as_str(), &[]).await.map_err(pg_error)?;
        let count: i64 = row.try_get(0).map_err(pg_error)?;
        Ok(SourceStats {
            version,
            status: "ok".to_string(),
            total_record_count: count.max(0) as u64,
        })
    }

    async fn get_target_stats(&self, _env: &Environment) -> Result<TargetStats> {
        let client = self.client().await?;
        let version = self.server_version(&client).await?;
        let row = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&self.table])
            .await
            .map_err(pg_error)?;
        let exists: bool = row.try_get(0).map_err(pg_error)?;
        Ok(TargetStats {
            version,
            status: if exists { "exists" } else { "missing" }.to_string(),
        })
    }

    async fn get_meta(&self, _env: &Environment) -> Result<Meta> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&self.options.schema, &self.options.table],
            )
            .await
            .map_err(pg_error)?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).map_err(pg_error)?;
            let data_type: String = row.try_get(1).map_err(pg_error)?;
            columns.push(json!({ "name": name, "type": data_type }));
        }
        Ok(json!({ "columns": columns }))
    }

    async fn put_meta(&self, _env: &Environment, meta: &Meta) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}; \
                 CREATE TABLE IF NOT EXISTS {} ({} text PRIMARY KEY, {} jsonb NOT NULL)",
                quote_pg_ident(&self.options.schema),
                self.table,
                self.key,
                self.data
            ))
            .await
            .map_err(pg_error)?;
        let source_columns = meta
            .get("columns")
            .and_then(Value::as_array)
            .map(|c| c.len())
            .unwrap_or(0);
        info!(
            "Ensured target table {} (source reported {} columns)",
            self.table, source_columns
        );
        Ok(())
    }

    async fn get_data(&self, _env: &Environment, offset: u64, size: usize) -> Result<Page> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {key}::text, {data}::jsonb FROM {table} ORDER BY {key} OFFSET $1 LIMIT $2",
            key = self.key,
            data = self.data,
            table = self.table
        );
        let offset = i64::try_from(offset)
            .map_err(|_| TransferError::fatal(DRIVER, format!("offset {} out of range", offset)))?;
        let limit = i64::try_from(size).unwrap_or(i64::MAX);
        let rows = client
            .query(sql.as_str(), &[&offset, &limit])
            .await
            .map_err(pg_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get(0).map_err(pg_error)?;
            let body: Value = row.try_get(1).map_err(pg_error)?;
            records.push(Record::new(id, body));
        }
        let exhausted = records.len() < size;
        debug!(
            "{}: read {} rows at offset {}",
            self.table,
            records.len(),
            offset
        );
        Ok(Page::new(records, exhausted))
    }

    async fn put_data(&self, _env: &Environment, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let (ids, docs) = dedup_last(records);
        let sql = format!(
            "INSERT INTO {table} ({key}, {data}) \
             SELECT * FROM UNNEST($1::text[], $2::jsonb[]) \
             ON CONFLICT ({key}) DO UPDATE SET {data} = EXCLUDED.{data}",
            table = self.table,
            key = self.key,
            data = self.data
        );
        let client = self.client().await?;
        let written = client
            .execute(sql.as_str(), &[&ids, &docs])
            .await
            .map_err(pg_error)?;
        Ok(written)
    }
}

/// Split records into parallel id/document arrays, keeping the last
/// occurrence of each id. A single upsert statement cannot touch the same
/// row twice.
fn dedup_last(records: &[Record]) -> (Vec<&str>, Vec<&Value>) {
    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<&Record> = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.id.as_str()))
        .collect();
    kept.reverse();
    kept.into_iter()
        .map(|r| (r.id.as_str(), &r.body))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    fn config() -> BackendConfig {
        BackendConfig::new("postgres")
            .with_option("connection", "host=localhost user=postgres dbname=app")
            .with_option("table", "events")
    }

    #[test]
    fn test_quote_pg_ident() {
        assert_eq!(quote_pg_ident("events"), "\"events\"");
        assert_eq!(quote_pg_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify_pg_table("public", "events"), "\"public\".\"events\"");
    }

    #[test]
    fn test_dedup_keeps_last_occurrence_in_order() {
        let records = vec![
            Record::new("a", json!(1)),
            Record::new("b", json!(2)),
            Record::new("a", json!(3)),
        ];
        let (ids, docs) = dedup_last(&records);
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(docs, vec![&json!(2), &json!(3)]);
    }

    #[tokio::test]
    async fn test_create_does_not_connect() {
        let backend = PostgresFactory
            .create(&config(), BackendContext::worker(Role::Source, 0))
            .unwrap();
        assert!(backend.verify_options().is_empty());
        assert_eq!(backend.get_info().id, "postgres");
    }

    #[test]
    fn test_verify_reports_missing_options() {
        let backend = PostgresFactory
            .create(
                &BackendConfig::new("postgres"),
                BackendContext::coordinator(Role::Target),
            )
            .unwrap();
        assert_eq!(backend.verify_options().len(), 2);
    }

    #[test]
    fn test_bad_connection_string_is_config_error() {
        let result = PostgresFactory.create(
            &BackendConfig::new("postgres").with_option("connection", "host=localhost bogus_option=1"),
            BackendContext::coordinator(Role::Source),
        );
        assert!(matches!(result, Err(TransferError::Config(_))));
    }
}
