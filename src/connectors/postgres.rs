//! Postgres connector
//!
//! One short-lived pool per call, closed on every exit path. Result
//! rows come back through `row_to_json`, so decoding stays uniform
//! across arbitrary column types.

use super::{
    clip_overfetch, guard_remote_sql, quote_table_ref, rows_to_dataframe, sync_dataframe,
    ColumnSpec, Credentials, DbType, SyncedTable, TableSummary, WarehouseConnector,
};
use crate::error::{EngineError, Result};
use crate::store::{QueryResult, Store};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct PostgresConnector;

impl PostgresConnector {
    pub fn new() -> Self {
        Self
    }

    fn connection_string(credentials: &Credentials) -> Result<String> {
        let host = credentials.require("host", &credentials.host)?;
        let username = credentials.require("username", &credentials.username)?;
        let password = credentials.require("password", &credentials.password)?;
        let database = credentials.require("database", &credentials.database)?;
        let port = credentials.port.unwrap_or(5432);
        Ok(format!(
            "postgres://{}:{}@{}:{}/{}",
            username, password, host, port, database
        ))
    }

    async fn connect(credentials: &Credentials, timeout: Duration) -> Result<PgPool> {
        let url = Self::connection_string(credentials)?;
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect(&url)
            .await
            .map_err(|e| EngineError::ConnectorAuth(format!("postgres connection failed: {}", e)))
    }

    async fn fetch_json_rows(
        pool: &PgPool,
        inner_sql: &str,
    ) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
        // Each result row arrives as one JSON object; column order is
        // recovered from the first row's key order (row_to_json
        // preserves select-list order).
        let wrapped = format!(
            "SELECT row_to_json(q)::text AS row_json FROM ({}) q",
            inner_sql
        );
        debug!(sql = %wrapped, "postgres fetch");
        let pg_rows = sqlx::query(&wrapped)
            .fetch_all(pool)
            .await
            .map_err(|e| EngineError::RemoteExecution {
                connector: "postgres".to_string(),
                detail: e.to_string(),
            })?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in pg_rows {
            let text: String = pg_row.try_get("row_json").map_err(|e| {
                EngineError::RemoteExecution {
                    connector: "postgres".to_string(),
                    detail: e.to_string(),
                }
            })?;
            let object: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&text)?;
            if columns.is_empty() {
                columns = object.keys().cloned().collect();
            }
            rows.push(
                columns
                    .iter()
                    .map(|c| object.get(c).cloned().unwrap_or(serde_json::Value::Null))
                    .collect(),
            );
        }
        Ok((columns, rows))
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
impl WarehouseConnector for PostgresConnector {
    fn db_type(&self) -> DbType {
        DbType::Postgres
    }

    async fn test_connection(&self, credentials: &Credentials) -> Result<(bool, String)> {
        let pool = match Self::connect(credentials, CONNECT_TIMEOUT).await {
            Ok(pool) => pool,
            Err(e) => return Ok((false, e.to_string())),
        };
        let probe = sqlx::query("SELECT 1").fetch_one(&pool).await;
        pool.close().await;
        match probe {
            Ok(_) => Ok((true, "connection ok".to_string())),
            Err(e) => Ok((false, format!("probe failed: {}", e))),
        }
    }

    async fn list_schemas(&self, credentials: &Credentials) -> Result<Vec<String>> {
        let pool = Self::connect(credentials, CONNECT_TIMEOUT).await?;
        let result = Self::fetch_json_rows(
            &pool,
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY schema_name",
        )
        .await;
        pool.close().await;
        let (_, rows) = result?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.first().and_then(|v| v.as_str().map(String::from)))
            .collect())
    }

    async fn list_tables(&self, credentials: &Credentials) -> Result<Vec<TableSummary>> {
        let pool = Self::connect(credentials, CONNECT_TIMEOUT).await?;
        // reltuples is the planner's estimate; cheap compared to
        // COUNT(*) per table
        let result = Self::fetch_json_rows(
            &pool,
            "SELECT n.nspname AS schema, c.relname AS name, \
             GREATEST(c.reltuples, 0)::bigint AS row_count \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind IN ('r', 'v', 'm') \
             AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY n.nspname, c.relname",
        )
        .await;
        pool.close().await;
        let (_, rows) = result?;
        Ok(rows
            .into_iter()
            .map(|r| TableSummary {
                schema: r.first().and_then(|v| v.as_str()).unwrap_or("").to_string(),
                name: r.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
                row_count: r.get(2).and_then(|v| v.as_u64()),
            })
            .collect())
    }

    async fn get_table_schema(
        &self,
        table: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ColumnSpec>> {
        let (schema, name) = match table.split_once('.') {
            Some((s, n)) => (s.to_string(), n.to_string()),
            None => ("public".to_string(), table.to_string()),
        };
        let pool = Self::connect(credentials, CONNECT_TIMEOUT).await?;
        let sql = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' \
             ORDER BY ordinal_position",
            schema.replace('\'', "''"),
            name.replace('\'', "''")
        );
        let result = Self::fetch_json_rows(&pool, &sql).await;
        pool.close().await;
        let (_, rows) = result?;
        if rows.is_empty() {
            return Err(EngineError::NotFound(format!("table '{}'", table)));
        }
        Ok(rows
            .into_iter()
            .map(|r| ColumnSpec {
                name: r.first().and_then(|v| v.as_str()).unwrap_or("").to_string(),
                data_type: r.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            })
            .collect())
    }

    async fn execute_query(
        &self,
        sql: &str,
        credentials: &Credentials,
        limit: usize,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let guarded = guard_remote_sql(sql, limit + 1)?;
        let start = Instant::now();
        let pool = Self::connect(credentials, timeout).await?;
        let result = Self::fetch_json_rows(&pool, &guarded).await;
        pool.close().await;
        let (columns, mut raw_rows) = result?;
        let truncated = clip_overfetch(&mut raw_rows, limit);

        let rows: Vec<HashMap<String, serde_json::Value>> = raw_rows
            .into_iter()
            .map(|r| columns.iter().cloned().zip(r).collect())
            .collect();
        let row_count = rows.len();
        Ok(QueryResult {
            columns,
            rows,
            row_count,
            truncated,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn sync(
        &self,
        tables: &[String],
        credentials: &Credentials,
        store: &Store,
        cache_dir: Option<&Path>,
        max_rows: Option<usize>,
    ) -> Result<Vec<SyncedTable>> {
        let pool = Self::connect(credentials, CONNECT_TIMEOUT).await?;
        let mut synced = Vec::with_capacity(tables.len());
        let mut failure = None;
        for table in tables {
            let mut fetch = format!(
                "SELECT * FROM {}",
                quote_table_ref(table, self.db_type().quote_char())
            );
            if let Some(cap) = max_rows {
                fetch.push_str(&format!(" LIMIT {}", cap));
            }
            let attempt = async {
                let (columns, rows) = Self::fetch_json_rows(&pool, &fetch).await?;
                let df = rows_to_dataframe(&columns, &rows)?;
                sync_dataframe(store, df, table, cache_dir)
            };
            match attempt.await {
                Ok(entry) => synced.push(entry),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        pool.close().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(synced),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_defaults_port() {
        let creds = Credentials {
            host: Some("db.internal".to_string()),
            username: Some("svc".to_string()),
            password: Some("pw".to_string()),
            database: Some("analytics".to_string()),
            ..Default::default()
        };
        assert_eq!(
            PostgresConnector::connection_string(&creds).unwrap(),
            "postgres://svc:pw@db.internal:5432/analytics"
        );
    }

    #[test]
    fn test_missing_credential_names_field() {
        let err = PostgresConnector::connection_string(&Credentials::default()).unwrap_err();
        assert!(err.to_string().contains("host"));
    }
}
