//! Schema Introspector
//!
//! Produces column-level statistics for a backing table. Profiles are
//! recomputed wholesale on every full re-ingestion, never patched.

use crate::error::Result;
use crate::registry::ColumnProfile;
use crate::safety::quote_ident;
use crate::store::Store;
use tracing::debug;

/// Ordered types get min/max; everything else reports none.
fn is_ordered_type(dtype: &str) -> bool {
    let upper = dtype.to_uppercase();
    ["INT", "DECIMAL", "NUMERIC", "FLOAT", "DOUBLE", "REAL", "DATE", "TIME"]
        .iter()
        .any(|t| upper.contains(t))
}

/// Inspect a backing table and produce one profile per column.
pub fn profile_table(store: &Store, table: &str, sample_cap: usize) -> Result<Vec<ColumnProfile>> {
    let described = store.describe_table(table)?;
    let quoted_table = quote_ident(table, '"');
    let mut profiles = Vec::with_capacity(described.len());

    for (name, data_type, nullable) in described {
        let quoted_col = quote_ident(&name, '"');
        let ordered = is_ordered_type(&data_type);

        let stats_sql = if ordered {
            format!(
                "SELECT COUNT(*) - COUNT({col}) AS null_count, \
                 COUNT(DISTINCT {col}) AS distinct_count, \
                 MIN({col}) AS min_value, MAX({col}) AS max_value \
                 FROM {table}",
                col = quoted_col,
                table = quoted_table
            )
        } else {
            format!(
                "SELECT COUNT(*) - COUNT({col}) AS null_count, \
                 COUNT(DISTINCT {col}) AS distinct_count, \
                 NULL AS min_value, NULL AS max_value \
                 FROM {table}",
                col = quoted_col,
                table = quoted_table
            )
        };

        let stats = store.query_bounded(&stats_sql, 1)?;
        let row = stats.rows.first();
        let get_usize = |key: &str| -> usize {
            row.and_then(|r| r.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize
        };
        let get_value = |key: &str| -> Option<serde_json::Value> {
            row.and_then(|r| r.get(key))
                .filter(|v| !v.is_null())
                .cloned()
        };

        let samples_sql = format!(
            "SELECT DISTINCT {col} AS sample FROM {table} WHERE {col} IS NOT NULL",
            col = quoted_col,
            table = quoted_table
        );
        let samples = store.query_bounded(&samples_sql, sample_cap)?;
        let sample_values: Vec<serde_json::Value> = samples
            .rows
            .iter()
            .filter_map(|r| r.get("sample").cloned())
            .collect();

        debug!(table, column = %name, %data_type, "profiled column");
        profiles.push(ColumnProfile {
            name,
            data_type,
            nullable,
            sample_values,
            null_count: get_usize("null_count"),
            distinct_count: get_usize("distinct_count"),
            min: get_value("min_value"),
            max: get_value("max_value"),
        });
    }

    Ok(profiles)
}
