//! Warehouse connectors
//!
//! A closed set of backends behind one capability interface. Adding a
//! backend means adding one variant and one implementation, never
//! touching call sites. Credentials are per-call and never persisted.

use crate::error::{EngineError, Result};
use crate::registry::SourceOrigin;
use crate::safety;
use crate::store::{QueryResult, Store};
use crate::sync::ingest_parquet;
use async_trait::async_trait;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub mod bigquery;
pub mod postgres;
pub mod snowflake;

pub use bigquery::BigQueryConnector;
pub use postgres::PostgresConnector;
pub use snowflake::SnowflakeConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Snowflake,
    Postgres,
    Bigquery,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Snowflake => "snowflake",
            DbType::Postgres => "postgres",
            DbType::Bigquery => "bigquery",
        }
    }

    /// Identifier quote character of the backend's SQL dialect.
    pub fn quote_char(&self) -> char {
        match self {
            DbType::Bigquery => '`',
            _ => '"',
        }
    }
}

/// Per-call connection parameters. Which fields matter depends on the
/// backend; tokens fall back to the environment so callers never have
/// to put them in request payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Credentials {
    pub fn require(&self, field: &str, value: &Option<String>) -> Result<String> {
        value
            .clone()
            .ok_or_else(|| EngineError::ConnectorAuth(format!("missing credential '{}'", field)))
    }

    /// Token from the payload, else the backend's environment variable.
    pub fn token_or_env(&self, env_var: &str) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        std::env::var(env_var).map_err(|_| {
            EngineError::ConnectorAuth(format!(
                "no token provided and {} is not set",
                env_var
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub schema: String,
    pub name: String,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedTable {
    pub source_id: String,
    pub table_name: String,
    pub row_count: usize,
}

/// Capability set every backend implements.
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    fn db_type(&self) -> DbType;

    /// Expected auth failures come back as `(false, message)`, never
    /// as an error.
    async fn test_connection(&self, credentials: &Credentials) -> Result<(bool, String)>;

    async fn list_schemas(&self, credentials: &Credentials) -> Result<Vec<String>>;

    async fn list_tables(&self, credentials: &Credentials) -> Result<Vec<TableSummary>>;

    async fn get_table_schema(
        &self,
        table: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ColumnSpec>>;

    async fn execute_query(
        &self,
        sql: &str,
        credentials: &Credentials,
        limit: usize,
        timeout: Duration,
    ) -> Result<QueryResult>;

    /// Sync remote tables into the local store, one source per table.
    async fn sync(
        &self,
        tables: &[String],
        credentials: &Credentials,
        store: &Store,
        cache_dir: Option<&Path>,
        max_rows: Option<usize>,
    ) -> Result<Vec<SyncedTable>>;
}

/// Backend selection by runtime tag.
pub fn connector_for(db_type: DbType) -> Box<dyn WarehouseConnector> {
    match db_type {
        DbType::Snowflake => Box::new(SnowflakeConnector::new()),
        DbType::Postgres => Box::new(PostgresConnector::new()),
        DbType::Bigquery => Box::new(BigQueryConnector::new()),
    }
}

/// Read-only gate plus the authoritative server-side cap, applied to
/// every statement before it reaches a remote backend.
pub(crate) fn guard_remote_sql(sql: &str, limit: usize) -> Result<String> {
    safety::ensure_read_only(sql)?;
    let cleaned = safety::strip_semicolons(sql);
    Ok(safety::bounded(&cleaned, limit))
}

/// Over-fetch-by-one truncation probe: connectors request `limit + 1`
/// rows, then clip. A full page is only flagged truncated when an
/// extra row actually came back.
pub(crate) fn clip_overfetch<T>(rows: &mut Vec<T>, limit: usize) -> bool {
    if rows.len() > limit {
        rows.truncate(limit);
        true
    } else {
        false
    }
}

/// Quote a possibly schema-qualified table reference part by part.
pub(crate) fn quote_table_ref(table: &str, quote: char) -> String {
    table
        .split('.')
        .map(|part| safety::quote_ident(part, quote))
        .collect::<Vec<_>>()
        .join(".")
}

/// Materialize fetched rows as a DataFrame. Going through the JSON
/// reader lets polars infer column types instead of forcing
/// everything to text.
pub(crate) fn rows_to_dataframe(
    columns: &[String],
    rows: &[Vec<serde_json::Value>],
) -> Result<DataFrame> {
    let objects: Vec<serde_json::Map<String, serde_json::Value>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
        .collect();
    let bytes = serde_json::to_vec(&objects)?;
    let df = JsonReader::new(Cursor::new(bytes))
        .with_json_format(JsonFormat::Json)
        .finish()?;
    Ok(df)
}

/// Write a DataFrame to parquet and hand it to the store. The file
/// has exactly two end states: promoted into the cache directory, or
/// deleted when the temp handle drops, including on any error below.
/// It lives under the data directory, next to its eventual cache home.
pub fn sync_dataframe(
    store: &Store,
    mut df: DataFrame,
    table: &str,
    cache_dir: Option<&Path>,
) -> Result<SyncedTable> {
    let data_dir = &store.config().data_dir;
    std::fs::create_dir_all(data_dir)?;
    let tmp = tempfile::Builder::new()
        .prefix("sync-")
        .suffix(".parquet")
        .tempfile_in(data_dir)?;
    ParquetWriter::new(tmp.as_file()).finish(&mut df)?;

    let source = match cache_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let cache_path = dir.join(format!("{}.parquet", table.replace(['.', '/'], "_")));
            let tmp_path = tmp.path().to_path_buf();
            std::fs::copy(&tmp_path, &cache_path)?;
            ingest_parquet(store, &cache_path, table, SourceOrigin::Sync)?
        }
        None => ingest_parquet(store, tmp.path(), table, SourceOrigin::Sync)?,
    };

    info!(table, source_id = %source.source_id, rows = source.row_count, "synced table");
    Ok(SyncedTable {
        source_id: source.source_id,
        table_name: source.table_name,
        row_count: source.row_count,
    })
}

/// Degraded mode for cache-backed connectors: serve a previously
/// synced parquet copy instead of failing outright.
pub fn sync_from_cache(
    store: &Store,
    table: &str,
    cache_dir: &Path,
    remote_error: &EngineError,
) -> Result<SyncedTable> {
    let cache_path = cache_dir.join(format!("{}.parquet", table.replace(['.', '/'], "_")));
    if !cache_path.exists() {
        return Err(EngineError::RemoteExecution {
            connector: "snowflake".to_string(),
            detail: format!("{} (no cached copy for '{}')", remote_error, table),
        });
    }
    warn!(table, error = %remote_error, "remote fetch failed, serving cached parquet");
    let source = ingest_parquet(store, &cache_path, table, SourceOrigin::Sync)?;
    Ok(SyncedTable {
        source_id: source.source_id,
        table_name: source.table_name,
        row_count: source.row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_guard_remote_sql_rejects_writes() {
        assert!(guard_remote_sql("DELETE FROM t", 100).is_err());
        assert!(guard_remote_sql("/* x */ DROP TABLE t", 100).is_err());
        let wrapped = guard_remote_sql("SELECT * FROM t LIMIT 99999", 100).unwrap();
        assert!(wrapped.ends_with("LIMIT 100"));
    }

    #[test]
    fn test_clip_overfetch_flags_only_real_overflow() {
        let mut exact: Vec<u32> = (0..10).collect();
        assert!(!clip_overfetch(&mut exact, 10));
        assert_eq!(exact.len(), 10);

        let mut over: Vec<u32> = (0..11).collect();
        assert!(clip_overfetch(&mut over, 10));
        assert_eq!(over.len(), 10);
    }

    #[test]
    fn test_quote_table_ref_per_dialect() {
        assert_eq!(quote_table_ref("public.orders", '"'), "\"public\".\"orders\"");
        assert_eq!(quote_table_ref("ds.orders", '`'), "`ds`.`orders`");
        assert_eq!(quote_table_ref("odd\"name", '"'), "\"odd\"\"name\"");
    }

    #[test]
    fn test_rows_to_dataframe_infers_types() {
        let columns = vec!["region".to_string(), "revenue".to_string()];
        let rows = vec![
            vec![serde_json::json!("east"), serde_json::json!(100.5)],
            vec![serde_json::json!("west"), serde_json::json!(250.0)],
        ];
        let df = rows_to_dataframe(&columns, &rows).unwrap();
        assert_eq!(df.shape(), (2, 2));
    }

    #[test]
    fn test_sync_dataframe_promotes_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(EngineConfig::with_data_dir(dir.path())).unwrap();
        let cache = dir.path().join("cache");

        let df = df![
            "region" => ["east", "west"],
            "revenue" => [100.0, 250.0]
        ]
        .unwrap();
        let synced = sync_dataframe(&store, df, "analytics.sales", Some(&cache)).unwrap();
        assert_eq!(synced.row_count, 2);
        assert!(cache.join("analytics_sales.parquet").exists());

        // Cached copy is now servable without a remote
        let served = sync_from_cache(
            &store,
            "analytics.sales",
            &cache,
            &EngineError::ConnectorUnavailable("offline".to_string()),
        )
        .unwrap();
        assert_eq!(served.row_count, 2);
    }

    #[test]
    fn test_sync_from_cache_without_copy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(EngineConfig::with_data_dir(dir.path())).unwrap();
        let err = sync_from_cache(
            &store,
            "nope",
            dir.path(),
            &EngineError::ConnectorUnavailable("offline".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::RemoteExecution { .. }));
    }

    #[test]
    fn test_token_env_fallback() {
        let creds = Credentials::default();
        std::env::set_var("TEST_CONNECTOR_TOKEN_XYZ", "abc");
        assert_eq!(
            creds.token_or_env("TEST_CONNECTOR_TOKEN_XYZ").unwrap(),
            "abc"
        );
        std::env::remove_var("TEST_CONNECTOR_TOKEN_XYZ");
        assert!(creds.token_or_env("TEST_CONNECTOR_TOKEN_XYZ").is_err());
    }
}
