//! Embedded analytical store
//!
//! One process-wide DuckDB connection plus the source registry, both
//! guarded by a single reentrant mutex. Reentrancy is required, not
//! optional: ingestion rollback calls back into lock-guarded
//! operations (drop table, remove entry) while the failing call still
//! holds the lock on the same thread.
//!
//! The handle is constructed explicitly and passed by `Arc` injection;
//! there is no module-level mutable state.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::registry::{Source, SourceRegistry};
use crate::safety;
use duckdb::types::Value;
use duckdb::Connection;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, info};

/// Bounded query result. Never an unbounded materialization: `rows`
/// is capped and `truncated` says whether the cap was hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

pub struct StoreShared {
    conn: Connection,
    registry: RefCell<SourceRegistry>,
}

/// Shared engine handle. All local-store operations (ingest,
/// introspect, query) serialize through the one lock.
pub struct Store {
    config: EngineConfig,
    shared: ReentrantMutex<StoreShared>,
}

impl Store {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        info!("opened in-memory analytical store");
        Ok(Self {
            config,
            shared: ReentrantMutex::new(StoreShared {
                conn,
                registry: RefCell::new(SourceRegistry::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hold the engine lock across a composite critical section.
    /// Leaf operations re-acquire it reentrantly on the same thread.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, StoreShared> {
        self.shared.lock()
    }

    /// Run a DDL/utility statement against the store.
    pub fn execute(&self, sql: &str) -> Result<()> {
        let shared = self.shared.lock();
        shared.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Execute a read statement wrapped in an authoritative outer
    /// LIMIT, decoding rows to JSON. The caller's own LIMIT, if any,
    /// only applies inside the bounding subquery.
    pub fn query_bounded(&self, sql: &str, cap: usize) -> Result<QueryResult> {
        let start = std::time::Instant::now();
        // Over-fetch by one row to detect truncation
        let bounded_sql = safety::bounded(sql, cap + 1);
        let shared = self.shared.lock();

        let mut stmt = shared.conn.prepare(&bounded_sql)?;
        let mut duck_rows = stmt.query([])?;

        let columns: Vec<String> = duck_rows
            .as_ref()
            .map(|r| r.column_names().iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let column_count = columns.len();

        let mut rows: Vec<HashMap<String, serde_json::Value>> = Vec::new();
        while let Some(row) = duck_rows.next()? {
            let mut map = HashMap::with_capacity(column_count);
            for (idx, name) in columns.iter().enumerate() {
                let value: Value = row.get(idx).unwrap_or(Value::Null);
                map.insert(name.clone(), value_to_json(value));
            }
            rows.push(map);
            if rows.len() > cap {
                break;
            }
        }

        let truncated = rows.len() > cap;
        if truncated {
            rows.truncate(cap);
        }

        let execution_time_ms = start.elapsed().as_millis() as u64;
        debug!(
            row_count = rows.len(),
            truncated,
            duration_ms = execution_time_ms,
            "query completed"
        );

        Ok(QueryResult {
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            execution_time_ms,
        })
    }

    /// Single-value count helper for a quoted table name.
    pub fn table_row_count(&self, table: &str) -> Result<usize> {
        let shared = self.shared.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", safety::quote_ident(table, '"'));
        let count: i64 = shared.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Column (name, type, nullable) triples from DESCRIBE.
    pub fn describe_table(&self, table: &str) -> Result<Vec<(String, String, bool)>> {
        let shared = self.shared.lock();
        let sql = format!("DESCRIBE {}", safety::quote_ident(table, '"'));
        let mut stmt = shared.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let dtype: String = row.get(1)?;
            let null_str: Option<String> = row.get(2).unwrap_or(None);
            let nullable = null_str.as_deref().map(|s| s != "NO").unwrap_or(true);
            out.push((name, dtype, nullable));
        }
        Ok(out)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let shared = self.shared.lock();
        let count: i64 = shared.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        let shared = self.shared.lock();
        let sql = format!(
            "DROP TABLE IF EXISTS {}",
            safety::quote_ident(table, '"')
        );
        shared.conn.execute_batch(&sql)?;
        debug!(table, "dropped backing table");
        Ok(())
    }

    // ---- registry access (always under the same lock) ----

    pub fn register_source(&self, source: Source) {
        let shared = self.shared.lock();
        shared.registry.borrow_mut().register(source);
    }

    pub fn lookup_source(&self, source_id: &str) -> Result<Source> {
        let shared = self.shared.lock();
        let found = shared.registry.borrow().lookup(source_id).cloned();
        found.ok_or_else(|| EngineError::NotFound(format!("source {}", source_id)))
    }

    pub fn list_sources(&self) -> Vec<Source> {
        let shared = self.shared.lock();
        let list = shared.registry.borrow().list();
        list
    }

    /// Remove a source and release its resources. Backing table drop
    /// and cached file deletion happen inside the same critical
    /// section as the registry removal, so the registry and the
    /// physical table never disagree.
    pub fn remove_source(&self, source_id: &str) -> Result<Source> {
        safety::validate_source_id(source_id)?;
        let _guard = self.shared.lock();

        // Drop the table before removing the registry entry: if the
        // drop errors, the entry stays and the source remains usable.
        let source = self.lookup_source(source_id)?;
        self.drop_table(&source.table_name)?;

        let removed = {
            let shared = self.shared.lock();
            let removed = shared.registry.borrow_mut().remove(source_id);
            removed
        }
        .unwrap_or(source);

        let source_dir = self.config.sources_dir().join(source_id);
        if source_dir.exists() {
            std::fs::remove_dir_all(&source_dir)?;
        }
        info!(source_id, "removed source");
        Ok(removed)
    }
}

/// Decode one DuckDB value to JSON. Exotic types fall back to their
/// debug rendering rather than failing the whole result.
pub fn value_to_json(value: Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(i) => Json::Number(i.into()),
        Value::SmallInt(i) => Json::Number(i.into()),
        Value::Int(i) => Json::Number(i.into()),
        Value::BigInt(i) => Json::Number(i.into()),
        Value::HugeInt(i) => {
            if let Ok(v) = i64::try_from(i) {
                Json::Number(v.into())
            } else {
                Json::String(i.to_string())
            }
        }
        Value::UTinyInt(u) => Json::Number(u.into()),
        Value::USmallInt(u) => Json::Number(u.into()),
        Value::UInt(u) => Json::Number(u.into()),
        Value::UBigInt(u) => Json::Number(u.into()),
        Value::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s),
        Value::Enum(s) => Json::String(s),
        Value::Date32(days) => days_to_date(days)
            .map(Json::String)
            .unwrap_or(Json::Null),
        Value::Timestamp(unit, raw) => timestamp_to_string(unit, raw)
            .map(Json::String)
            .unwrap_or(Json::Null),
        Value::Blob(bytes) => Json::String(format!("<blob {} bytes>", bytes.len())),
        other => Json::String(format!("{:?}", other)),
    }
}

fn days_to_date(days: i32) -> Option<String> {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)?;
    epoch
        .checked_add_signed(chrono::Duration::days(days as i64))
        .map(|d| d.to_string())
}

fn timestamp_to_string(unit: duckdb::types::TimeUnit, raw: i64) -> Option<String> {
    use duckdb::types::TimeUnit;
    let micros = match unit {
        TimeUnit::Second => raw.checked_mul(1_000_000)?,
        TimeUnit::Millisecond => raw.checked_mul(1_000)?,
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc().to_string())
}
