//! Snowflake connector
//!
//! Talks to the SQL API (v2 statements endpoint) over HTTPS with a
//! bearer token. Sync keeps a parquet copy of every fetched table in
//! the cache directory, and serves that copy when the remote call
//! fails: degraded mode is intentional behavior for this backend.

use super::{
    clip_overfetch, guard_remote_sql, quote_table_ref, rows_to_dataframe, sync_dataframe,
    sync_from_cache, ColumnSpec, Credentials, DbType, SyncedTable, TableSummary,
    WarehouseConnector,
};
use crate::error::{EngineError, Result};
use crate::store::{QueryResult, Store};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

const TOKEN_ENV: &str = "SNOWFLAKE_TOKEN";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

pub struct SnowflakeConnector;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    // Only the first result-set partition is consumed. The SQL API
    // splits results past a few MB into further partitions fetched by
    // statement handle; rows beyond partition 0 are not retrieved, so
    // callers needing completeness must stay within the row caps.
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

impl SnowflakeConnector {
    pub fn new() -> Self {
        Self
    }

    fn endpoint(credentials: &Credentials) -> Result<String> {
        let account = credentials.require("account", &credentials.account)?;
        Ok(format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            account
        ))
    }

    async fn run_statement(
        &self,
        sql: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<StatementResponse> {
        let endpoint = Self::endpoint(credentials)?;
        let token = credentials.token_or_env(TOKEN_ENV)?;

        let mut body = serde_json::json!({
            "statement": sql,
            "timeout": timeout.as_secs(),
        });
        if let Some(database) = &credentials.database {
            body["database"] = serde_json::json!(database);
        }
        if let Some(schema) = &credentials.schema {
            body["schema"] = serde_json::json!(schema);
        }
        if let Some(warehouse) = &credentials.warehouse {
            body["warehouse"] = serde_json::json!(warehouse);
        }

        debug!(sql, "snowflake statement");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ConnectorUnavailable(e.to_string()))?;
        let response = client
            .post(&endpoint)
            .bearer_auth(&token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ConnectorUnavailable(format!("snowflake: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(EngineError::ConnectorAuth(format!(
                "snowflake rejected credentials ({})",
                status
            )));
        }
        let parsed: StatementResponse = response.json().await.map_err(|e| {
            EngineError::RemoteExecution {
                connector: "snowflake".to_string(),
                detail: format!("unreadable response: {}", e),
            }
        })?;
        if !status.is_success() {
            return Err(EngineError::RemoteExecution {
                connector: "snowflake".to_string(),
                detail: parsed
                    .message
                    .unwrap_or_else(|| format!("status {}", status)),
            });
        }
        Ok(parsed)
    }

    fn response_columns(response: &StatementResponse) -> Vec<(String, String)> {
        response
            .result_set_meta_data
            .as_ref()
            .map(|m| {
                m.row_type
                    .iter()
                    .map(|rt| (rt.name.clone(), rt.column_type.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cell text to JSON, using the declared column type. The SQL API
    /// serializes every cell as a string.
    fn decode_cell(raw: &Option<String>, column_type: &str) -> serde_json::Value {
        let Some(text) = raw else {
            return serde_json::Value::Null;
        };
        match column_type.to_uppercase().as_str() {
            "FIXED" | "REAL" => text
                .parse::<f64>()
                .map(|n| serde_json::json!(n))
                .unwrap_or_else(|_| serde_json::json!(text)),
            "BOOLEAN" => serde_json::json!(text == "true" || text == "1"),
            _ => serde_json::json!(text),
        }
    }

    async fn fetch_table(
        &self,
        table: &str,
        credentials: &Credentials,
        max_rows: Option<usize>,
    ) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
        let mut sql = format!(
            "SELECT * FROM {}",
            quote_table_ref(table, self.db_type().quote_char())
        );
        if let Some(cap) = max_rows {
            sql.push_str(&format!(" LIMIT {}", cap));
        }
        let response = self.run_statement(&sql, credentials, DEFAULT_TIMEOUT).await?;
        let columns = Self::response_columns(&response);
        let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        let rows = response
            .data
            .iter()
            .map(|row| {
                row.iter()
                    .zip(columns.iter())
                    .map(|(cell, (_, ty))| Self::decode_cell(cell, ty))
                    .collect()
            })
            .collect();
        Ok((names, rows))
    }
}

#[async_trait]
impl WarehouseConnector for SnowflakeConnector {
    fn db_type(&self) -> DbType {
        DbType::Snowflake
    }

    async fn test_connection(&self, credentials: &Credentials) -> Result<(bool, String)> {
        match self
            .run_statement("SELECT 1", credentials, Duration::from_secs(15))
            .await
        {
            Ok(_) => Ok((true, "connection ok".to_string())),
            Err(EngineError::ConnectorAuth(msg)) => Ok((false, msg)),
            Err(EngineError::ConnectorUnavailable(msg)) => Ok((false, msg)),
            Err(e) => Err(e),
        }
    }

    async fn list_schemas(&self, credentials: &Credentials) -> Result<Vec<String>> {
        let response = self
            .run_statement(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('INFORMATION_SCHEMA') ORDER BY schema_name",
                credentials,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(response
            .data
            .iter()
            .filter_map(|row| row.first().cloned().flatten())
            .collect())
    }

    async fn list_tables(&self, credentials: &Credentials) -> Result<Vec<TableSummary>> {
        // information_schema.tables carries maintained row counts, no
        // COUNT(*) needed
        let response = self
            .run_statement(
                "SELECT table_schema, table_name, row_count \
                 FROM information_schema.tables \
                 WHERE table_schema != 'INFORMATION_SCHEMA' \
                 ORDER BY table_schema, table_name",
                credentials,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(response
            .data
            .iter()
            .map(|row| TableSummary {
                schema: row.first().cloned().flatten().unwrap_or_default(),
                name: row.get(1).cloned().flatten().unwrap_or_default(),
                row_count: row
                    .get(2)
                    .cloned()
                    .flatten()
                    .and_then(|s| s.parse().ok()),
            })
            .collect())
    }

    async fn get_table_schema(
        &self,
        table: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ColumnSpec>> {
        let sql = format!(
            "DESCRIBE TABLE {}",
            quote_table_ref(table, self.db_type().quote_char())
        );
        let response = self.run_statement(&sql, credentials, DEFAULT_TIMEOUT).await?;
        let columns = response
            .data
            .iter()
            .map(|row| ColumnSpec {
                name: row.first().cloned().flatten().unwrap_or_default(),
                data_type: row.get(1).cloned().flatten().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(EngineError::NotFound(format!("table '{}'", table)));
        }
        Ok(columns)
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
        let response = self.run_statement(&guarded, credentials, timeout).await?;

        let column_meta = Self::response_columns(&response);
        let columns: Vec<String> = column_meta.iter().map(|(n, _)| n.clone()).collect();
        let mut rows: Vec<HashMap<String, serde_json::Value>> = response
            .data
            .iter()
            .map(|row| {
                row.iter()
                    .zip(column_meta.iter())
                    .map(|(cell, (name, ty))| (name.clone(), Self::decode_cell(cell, ty)))
                    .collect()
            })
            .collect();
        let truncated = clip_overfetch(&mut rows, limit);
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
        let mut synced = Vec::with_capacity(tables.len());
        for table in tables {
            let remote = self.fetch_table(table, credentials, max_rows).await;
            let entry = match remote {
                Ok((columns, rows)) => {
                    let df = rows_to_dataframe(&columns, &rows)?;
                    sync_dataframe(store, df, table, cache_dir)?
                }
                Err(remote_error) => match cache_dir {
                    Some(dir) => sync_from_cache(store, table, dir, &remote_error)?,
                    None => return Err(remote_error),
                },
            };
            synced.push(entry);
        }
        Ok(synced)
    }
}
