//! Engine facade
//!
//! The one surface the serving layer talks to. Ad-hoc SQL, LLM-proposed
//! SQL, and built chart queries all funnel through the same read-only
//! gate and the same bounded execution path; nothing gets elevated
//! trust because of where it came from.

use crate::config::EngineConfig;
use crate::connectors::{connector_for, Credentials, DbType, SyncedTable, TableSummary};
use crate::error::{EngineError, Result};
use crate::ingest;
use crate::query_builder::{build_query, BuiltQuery, ChartSpec, RowCaps};
use crate::registry::Source;
use crate::safety::{self, quote_ident};
use crate::store::{QueryResult, Store};
use crate::transform::{apply_transform, Transform};
use std::time::Duration;
use tracing::info;

/// A built chart query together with its execution result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChartData {
    pub sql: String,
    pub x: String,
    pub y: Vec<String>,
    pub series: Option<String>,
    pub result: QueryResult,
}

pub struct Engine {
    store: Store,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = Store::open(config)?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Restore every retained source after a restart.
    pub fn rehydrate(&self) -> Result<usize> {
        ingest::rehydrate(&self.store)
    }

    // ---- sources ----

    pub fn ingest_file(&self, bytes: &[u8], declared_filename: &str) -> Result<Source> {
        ingest::ingest_csv(&self.store, bytes, declared_filename)
    }

    pub fn list_sources(&self) -> Vec<Source> {
        self.store.list_sources()
    }

    pub fn get_source(&self, source_id: &str) -> Result<Source> {
        safety::validate_source_id(source_id)?;
        self.store.lookup_source(source_id)
    }

    pub fn delete_source(&self, source_id: &str) -> Result<Source> {
        self.store.remove_source(source_id)
    }

    pub fn transform_source(&self, source_id: &str, transform: Transform) -> Result<Source> {
        apply_transform(&self.store, source_id, transform)
    }

    // ---- local execution ----

    /// Run untrusted SQL against one source's backing table. Rejection
    /// by the read-only gate surfaces as `UnsafeStatement`, separate
    /// from execution failures.
    pub fn execute_sql(&self, source_id: &str, sql: &str) -> Result<QueryResult> {
        safety::validate_source_id(source_id)?;
        self.store.lookup_source(source_id)?;
        safety::ensure_read_only(sql)?;
        let cleaned = safety::strip_semicolons(sql);
        self.store
            .query_bounded(&cleaned, self.store.config().adhoc_row_cap)
    }

    /// First rows of a source, for table display.
    pub fn preview(&self, source_id: &str, limit: usize) -> Result<QueryResult> {
        let source = self.get_source(source_id)?;
        let cap = limit.min(self.store.config().raw_row_cap);
        self.store.query_bounded(
            &format!("SELECT * FROM {}", quote_ident(&source.table_name, '"')),
            cap,
        )
    }

    /// Distinct non-null values of one column, for filter dropdowns.
    pub fn distinct_values(&self, source_id: &str, column: &str) -> Result<Vec<serde_json::Value>> {
        let source = self.get_source(source_id)?;
        let columns = source.column_names();
        if !columns.iter().any(|c| c == column) {
            let mut valid = columns;
            valid.sort();
            return Err(EngineError::UnknownColumn {
                column: column.to_string(),
                valid,
            });
        }
        let sql = format!(
            "SELECT DISTINCT {col} AS v FROM {table} WHERE {col} IS NOT NULL ORDER BY v",
            col = quote_ident(column, '"'),
            table = quote_ident(&source.table_name, '"'),
        );
        let result = self
            .store
            .query_bounded(&sql, self.store.config().raw_row_cap)?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|mut r| r.remove("v"))
            .collect())
    }

    /// Build the SQL for a chart spec without running it.
    pub fn build_chart_sql(&self, spec: &ChartSpec) -> Result<BuiltQuery> {
        let source = self.get_source(&spec.source_id)?;
        let caps = RowCaps {
            raw: self.store.config().raw_row_cap,
            agg: self.store.config().agg_row_cap,
        };
        build_query(spec, &source.table_name, &source.column_names(), caps)
    }

    /// Build and execute a chart query in one step.
    pub fn build_and_run(&self, spec: &ChartSpec) -> Result<ChartData> {
        let built = self.build_chart_sql(spec)?;
        // Built SQL takes the same gate as ad-hoc SQL
        safety::ensure_read_only(&built.sql)?;
        let cap = if built.aggregated {
            self.store.config().agg_row_cap
        } else {
            self.store.config().raw_row_cap
        };
        let mut result = self.store.query_bounded(&built.sql, cap)?;
        // The built SQL carries its own LIMIT equal to the cap, so the
        // over-fetch probe cannot see past it; a full page means the
        // cap was reached.
        result.truncated = result.truncated || result.row_count >= cap;
        info!(
            source_id = %spec.source_id,
            rows = result.row_count,
            "chart query executed"
        );
        Ok(ChartData {
            sql: built.sql,
            x: built.x,
            y: built.y,
            series: built.series,
            result,
        })
    }

    // ---- remote connectors ----

    pub async fn test_connection(
        &self,
        db_type: DbType,
        credentials: &Credentials,
    ) -> Result<(bool, String)> {
        connector_for(db_type).test_connection(credentials).await
    }

    pub async fn list_remote_tables(
        &self,
        db_type: DbType,
        credentials: &Credentials,
    ) -> Result<Vec<TableSummary>> {
        connector_for(db_type).list_tables(credentials).await
    }

    pub async fn execute_remote(
        &self,
        db_type: DbType,
        sql: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<QueryResult> {
        connector_for(db_type)
            .execute_query(sql, credentials, self.store.config().adhoc_row_cap, timeout)
            .await
    }

    /// Pull remote tables into the local store, one new source each.
    pub async fn sync_connector(
        &self,
        db_type: DbType,
        tables: &[String],
        credentials: &Credentials,
        max_rows: Option<usize>,
    ) -> Result<Vec<SyncedTable>> {
        let cache_dir = self.store.config().sync_cache_dir();
        connector_for(db_type)
            .sync(tables, credentials, &self.store, Some(&cache_dir), max_rows)
            .await
    }
}
