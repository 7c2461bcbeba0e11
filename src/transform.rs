//! In-place source transforms
//!
//! Rename/delete/reorder column, cast type, edit cell. Each operation
//! rewrites the cached tabular file from a transformed view of the
//! backing table, then re-runs ingestion under the *same* source id,
//! so profiles are recomputed wholesale and the file stays the source
//! of truth for rehydration.

use crate::error::{EngineError, Result};
use crate::ingest;
use crate::registry::Source;
use crate::safety::{quote_ident, validate_source_id};
use crate::store::Store;
use itertools::Itertools;
use tracing::info;

/// Target types accepted by `cast_column`. A closed set: the type name
/// is interpolated into SQL and must never be caller-controlled text.
const CAST_TYPES: [&str; 7] = [
    "INTEGER",
    "BIGINT",
    "DOUBLE",
    "VARCHAR",
    "DATE",
    "TIMESTAMP",
    "BOOLEAN",
];

#[derive(Debug, Clone)]
pub enum Transform {
    RenameColumn { from: String, to: String },
    DeleteColumn { column: String },
    ReorderColumns { order: Vec<String> },
    CastColumn { column: String, target_type: String },
    EditCell { column: String, row_index: usize, value: serde_json::Value },
}

/// Apply one transform to an existing source.
pub fn apply_transform(store: &Store, source_id: &str, transform: Transform) -> Result<Source> {
    validate_source_id(source_id)?;

    let _guard = store.lock();
    let source = store.lookup_source(source_id)?;
    let columns = source.column_names();

    let sql = build_transform_sql(&columns, &transform, &source.table_name)?;
    rewrite_cached_file(store, &source, &sql)?;

    // Re-ingest the rewritten file under the same id; on failure the
    // rollback inside ingestion drops the partial table, and the
    // previous file content is already gone, so surface the error.
    let source_dir = store.config().sources_dir().join(source_id);
    let file_path = source_dir.join(cached_filename(&source));
    let refreshed = ingest::ingest_file_as(
        store,
        &file_path,
        source_id,
        &source.display_name,
        ',',
        source.origin,
    )?;
    info!(source_id, ?transform, "applied transform");
    Ok(refreshed)
}

fn cached_filename(source: &Source) -> String {
    ingest::sanitize_filename(&source.display_name)
}

fn require_column(columns: &[String], column: &str) -> Result<()> {
    if columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        let mut valid = columns.to_vec();
        valid.sort();
        Err(EngineError::UnknownColumn {
            column: column.to_string(),
            valid,
        })
    }
}

fn build_transform_sql(
    columns: &[String],
    transform: &Transform,
    table_name: &str,
) -> Result<String> {
    let table = quote_ident(table_name, '"');
    let select_list = match transform {
        Transform::RenameColumn { from, to } => {
            require_column(columns, from)?;
            if columns.iter().any(|c| c == to) {
                return Err(EngineError::QueryBuild(format!(
                    "column '{}' already exists",
                    to
                )));
            }
            columns
                .iter()
                .map(|c| {
                    if c == from {
                        format!("{} AS {}", quote_ident(c, '"'), quote_ident(to, '"'))
                    } else {
                        quote_ident(c, '"')
                    }
                })
                .join(", ")
        }
        Transform::DeleteColumn { column } => {
            require_column(columns, column)?;
            if columns.len() == 1 {
                return Err(EngineError::QueryBuild(
                    "cannot delete the last remaining column".to_string(),
                ));
            }
            columns
                .iter()
                .filter(|c| *c != column)
                .map(|c| quote_ident(c, '"'))
                .join(", ")
        }
        Transform::ReorderColumns { order } => {
            for c in order {
                require_column(columns, c)?;
            }
            if order.len() != columns.len() {
                return Err(EngineError::QueryBuild(format!(
                    "reorder must name all {} columns, got {}",
                    columns.len(),
                    order.len()
                )));
            }
            order.iter().map(|c| quote_ident(c, '"')).join(", ")
        }
        Transform::CastColumn { column, target_type } => {
            require_column(columns, column)?;
            let target = target_type.to_uppercase();
            if !CAST_TYPES.contains(&target.as_str()) {
                return Err(EngineError::QueryBuild(format!(
                    "unsupported cast target '{}'; valid: {}",
                    target_type,
                    CAST_TYPES.join(", ")
                )));
            }
            columns
                .iter()
                .map(|c| {
                    if c == column {
                        format!(
                            "TRY_CAST({col} AS {ty}) AS {col}",
                            col = quote_ident(c, '"'),
                            ty = target
                        )
                    } else {
                        quote_ident(c, '"')
                    }
                })
                .join(", ")
        }
        Transform::EditCell { column, row_index, value } => {
            require_column(columns, column)?;
            let literal = json_to_sql_literal(value);
            // Positional edit over the table's natural order
            let select_list = columns
                .iter()
                .map(|c| {
                    if c == column {
                        format!(
                            "CASE WHEN __rn = {} THEN {} ELSE {} END AS {}",
                            row_index + 1,
                            literal,
                            quote_ident(c, '"'),
                            quote_ident(c, '"')
                        )
                    } else {
                        quote_ident(c, '"')
                    }
                })
                .join(", ");
            return Ok(format!(
                "SELECT {} FROM (SELECT *, ROW_NUMBER() OVER () AS __rn FROM {}) numbered",
                select_list, table
            ));
        }
    };

    Ok(format!("SELECT {} FROM {}", select_list, table))
}

fn json_to_sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            let s = match other {
                serde_json::Value::String(s) => s.clone(),
                _ => other.to_string(),
            };
            format!("'{}'", s.replace('\'', "''"))
        }
    }
}

/// Overwrite the cached file from a transformed SELECT. The rewrite
/// goes through a uniquely named temp file in the same directory and
/// is renamed into place, so a mid-write failure cannot corrupt the
/// retained copy.
fn rewrite_cached_file(store: &Store, source: &Source, select_sql: &str) -> Result<()> {
    let source_dir = store.config().sources_dir().join(&source.source_id);
    std::fs::create_dir_all(&source_dir)?;
    let final_path = source_dir.join(cached_filename(source));

    let tmp = tempfile::Builder::new()
        .prefix(".rewrite-")
        .suffix(".csv")
        .tempfile_in(&source_dir)?;

    let copy_sql = format!(
        "COPY ({}) TO '{}' (HEADER, DELIMITER ',')",
        select_sql,
        tmp.path().to_string_lossy().replace('\'', "''"),
    );
    store.execute(&copy_sql)?;

    tmp.persist(&final_path)
        .map_err(|e| EngineError::Ingest(format!("failed to replace cached file: {}", e)))?;
    Ok(())
}
