//! BigQuery connector
//!
//! Uses the REST `jobs.query` endpoint with a bearer token. Row counts
//! for table listings come from the per-dataset `__TABLES__` metadata
//! view, which is maintained by the service and free to read.

use super::{
    clip_overfetch, guard_remote_sql, quote_table_ref, rows_to_dataframe, sync_dataframe,
    ColumnSpec, Credentials, DbType, SyncedTable, TableSummary, WarehouseConnector,
};
use crate::error::{EngineError, Result};
use crate::store::{QueryResult, Store};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

const TOKEN_ENV: &str = "BIGQUERY_TOKEN";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

pub struct BigQueryConnector;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    #[serde(default)]
    v: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl BigQueryConnector {
    pub fn new() -> Self {
        Self
    }

    async fn run_query(
        &self,
        sql: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<QueryResponse> {
        let project = credentials.require("project_id", &credentials.project_id)?;
        let token = credentials.token_or_env(TOKEN_ENV)?;
        let endpoint = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            project
        );

        debug!(sql, "bigquery query");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ConnectorUnavailable(e.to_string()))?;
        let response = client
            .post(&endpoint)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "query": sql,
                "useLegacySql": false,
                "timeoutMs": timeout.as_millis() as u64,
            }))
            .send()
            .await
            .map_err(|e| EngineError::ConnectorUnavailable(format!("bigquery: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(EngineError::ConnectorAuth(format!(
                "bigquery rejected credentials ({})",
                status
            )));
        }
        let parsed: QueryResponse = response.json().await.map_err(|e| {
            EngineError::RemoteExecution {
                connector: "bigquery".to_string(),
                detail: format!("unreadable response: {}", e),
            }
        })?;
        if let Some(error) = parsed.error {
            return Err(EngineError::RemoteExecution {
                connector: "bigquery".to_string(),
                detail: error.message,
            });
        }
        if !status.is_success() {
            return Err(EngineError::RemoteExecution {
                connector: "bigquery".to_string(),
                detail: format!("status {}", status),
            });
        }
        Ok(parsed)
    }

    /// Cell value to JSON. BigQuery serializes scalars as strings;
    /// the declared type drives numeric/boolean recovery.
    fn decode_cell(cell: &Cell, field_type: &str) -> serde_json::Value {
        let Some(value) = &cell.v else {
            return serde_json::Value::Null;
        };
        let serde_json::Value::String(text) = value else {
            return value.clone();
        };
        match field_type.to_uppercase().as_str() {
            "INTEGER" | "INT64" => text
                .parse::<i64>()
                .map(|n| serde_json::json!(n))
                .unwrap_or_else(|_| serde_json::json!(text)),
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
                .parse::<f64>()
                .map(|n| serde_json::json!(n))
                .unwrap_or_else(|_| serde_json::json!(text)),
            "BOOLEAN" | "BOOL" => serde_json::json!(text == "true"),
            _ => serde_json::json!(text),
        }
    }

    fn response_to_rows(
        response: &QueryResponse,
    ) -> (Vec<String>, Vec<Vec<serde_json::Value>>) {
        let fields = response
            .schema
            .as_ref()
            .map(|s| s.fields.as_slice())
            .unwrap_or_default();
        let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        let rows = response
            .rows
            .iter()
            .map(|row| {
                row.f
                    .iter()
                    .zip(fields.iter())
                    .map(|(cell, field)| Self::decode_cell(cell, &field.field_type))
                    .collect()
            })
            .collect();
        (columns, rows)
    }
}

#[async_trait]
impl WarehouseConnector for BigQueryConnector {
    fn db_type(&self) -> DbType {
        DbType::Bigquery
    }

    async fn test_connection(&self, credentials: &Credentials) -> Result<(bool, String)> {
        match self
            .run_query("SELECT 1", credentials, Duration::from_secs(15))
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
            .run_query(
                "SELECT schema_name FROM INFORMATION_SCHEMA.SCHEMATA ORDER BY schema_name",
                credentials,
                DEFAULT_TIMEOUT,
            )
            .await?;
        let (_, rows) = Self::response_to_rows(&response);
        Ok(rows
            .into_iter()
            .filter_map(|r| r.first().and_then(|v| v.as_str().map(String::from)))
            .collect())
    }

    async fn list_tables(&self, credentials: &Credentials) -> Result<Vec<TableSummary>> {
        let project = credentials.require("project_id", &credentials.project_id)?;
        let datasets = self.list_schemas(credentials).await?;
        let mut tables = Vec::new();
        for dataset in datasets {
            let sql = format!(
                "SELECT dataset_id, table_id, row_count FROM {}.__TABLES__ ORDER BY table_id",
                quote_table_ref(&format!("{}.{}", project, dataset), '`')
            );
            let response = self.run_query(&sql, credentials, DEFAULT_TIMEOUT).await?;
            let (_, rows) = Self::response_to_rows(&response);
            tables.extend(rows.into_iter().map(|r| TableSummary {
                schema: r.first().and_then(|v| v.as_str()).unwrap_or("").to_string(),
                name: r.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
                row_count: r.get(2).and_then(|v| v.as_u64()),
            }));
        }
        Ok(tables)
    }

    async fn get_table_schema(
        &self,
        table: &str,
        credentials: &Credentials,
    ) -> Result<Vec<ColumnSpec>> {
        let response = self
            .run_query(
                &format!(
                    "SELECT * FROM {} LIMIT 0",
                    quote_table_ref(table, self.db_type().quote_char())
                ),
                credentials,
                DEFAULT_TIMEOUT,
            )
            .await?;
        let fields = response
            .schema
            .as_ref()
            .map(|s| s.fields.as_slice())
            .unwrap_or_default();
        if fields.is_empty() {
            return Err(EngineError::NotFound(format!("table '{}'", table)));
        }
        Ok(fields
            .iter()
            .map(|f| ColumnSpec {
                name: f.name.clone(),
                data_type: f.field_type.clone(),
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
        let response = self.run_query(&guarded, credentials, timeout).await?;
        let (columns, mut raw_rows) = Self::response_to_rows(&response);
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
        let mut synced = Vec::with_capacity(tables.len());
        for table in tables {
            let mut sql = format!(
                "SELECT * FROM {}",
                quote_table_ref(table, self.db_type().quote_char())
            );
            if let Some(cap) = max_rows {
                sql.push_str(&format!(" LIMIT {}", cap));
            }
            let response = self.run_query(&sql, credentials, DEFAULT_TIMEOUT).await?;
            let (columns, rows) = Self::response_to_rows(&response);
            let df = rows_to_dataframe(&columns, &rows)?;
            synced.push(sync_dataframe(store, df, table, cache_dir)?);
        }
        Ok(synced)
    }
}
