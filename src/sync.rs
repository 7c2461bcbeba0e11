//! Ingest-Columnar-File Pipeline
//!
//! Given any parquet file (from a connector sync or a cache
//! directory), create or replace a backing table and register a fresh
//! source. Atomic with respect to partial failure: if anything after
//! table creation fails, the table is dropped and no source id is
//! ever observable.

use crate::error::{EngineError, Result};
use crate::profile::profile_table;
use crate::registry::{generate_source_id, Source, SourceOrigin};
use crate::safety;
use crate::store::Store;
use chrono::Utc;
use std::path::Path;
use tracing::info;

/// Load a parquet file into a new backing table and register it.
pub fn ingest_parquet(
    store: &Store,
    parquet_path: &Path,
    display_name: &str,
    origin: SourceOrigin,
) -> Result<Source> {
    let source_id = generate_source_id();
    let table_name = safety::table_name_for(&source_id)?;

    let _guard = store.lock();
    match load_and_register(store, parquet_path, &source_id, &table_name, display_name, origin) {
        Ok(source) => Ok(source),
        Err(err) => {
            // No orphan table, no registry entry
            crate::ingest::rollback(store, &source_id, None);
            Err(err)
        }
    }
}

fn load_and_register(
    store: &Store,
    parquet_path: &Path,
    source_id: &str,
    table_name: &str,
    display_name: &str,
    origin: SourceOrigin,
) -> Result<Source> {
    let path_literal = format!("'{}'", parquet_path.to_string_lossy().replace('\'', "''"));
    let sql = format!(
        "CREATE OR REPLACE TABLE {table} AS SELECT * FROM read_parquet({path})",
        table = safety::quote_ident(table_name, '"'),
        path = path_literal,
    );
    store.execute(&sql)?;

    // Same acceptance bar as the CSV path: a source is only
    // observable once its table has at least one column and one row
    let described = store.describe_table(table_name)?;
    let row_count = store.table_row_count(table_name)?;
    if described.is_empty() || row_count == 0 {
        return Err(EngineError::Ingest(format!(
            "parquet file for '{}' produced an empty table",
            display_name
        )));
    }

    let columns = profile_table(store, table_name, store.config().sample_values)?;

    let source = Source {
        source_id: source_id.to_string(),
        origin,
        table_name: table_name.to_string(),
        display_name: display_name.to_string(),
        ingested_at: Utc::now(),
        row_count,
        columns,
    };
    store.register_source(source.clone());
    info!(source_id, row_count, display_name, "ingested parquet source");
    Ok(source)
}
