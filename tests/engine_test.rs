//! End-to-end engine tests
//!
//! Exercise the full lifecycle through the public facade: upload,
//! profile, query, transform, sync from a parquet file, restart
//! rehydration, and the failure paths that must leave nothing behind.

use lumen_engine::config::EngineConfig;
use lumen_engine::connectors;
use lumen_engine::error::EngineError;
use lumen_engine::query_builder::{Aggregation, ChartSpec, TimeGrain, YAxis};
use lumen_engine::registry::SourceOrigin;
use lumen_engine::transform::Transform;
use lumen_engine::Engine;
use polars::prelude::*;
use std::path::Path;

fn engine_in(dir: &Path) -> Engine {
    Engine::open(EngineConfig::with_data_dir(dir)).unwrap()
}

fn sales_csv() -> &'static [u8] {
    b"month,region,revenue,cost\n\
      2024-01-05,east,100,40\n\
      2024-01-20,west,150,50\n\
      2024-02-03,east,200,70\n\
      2024-02-11,west,250,90\n"
}

#[test]
fn test_upload_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    let source = engine.ingest_file(sales_csv(), "sales.csv").unwrap();
    assert_eq!(source.row_count, 4);
    assert_eq!(source.origin, SourceOrigin::Upload);

    // Profile carries typed stats per column
    let revenue = source.columns.iter().find(|c| c.name == "revenue").unwrap();
    assert!(revenue.data_type.to_uppercase().contains("INT"));
    assert_eq!(revenue.null_count, 0);
    assert_eq!(revenue.min, Some(serde_json::json!(100)));
    assert_eq!(revenue.max, Some(serde_json::json!(250)));

    // Ad-hoc SQL through the safety gate
    let result = engine
        .execute_sql(
            &source.source_id,
            &format!(
                "SELECT region, SUM(revenue) AS total FROM src_{} GROUP BY region ORDER BY region",
                source.source_id
            ),
        )
        .unwrap();
    assert_eq!(result.row_count, 2);
    assert_eq!(
        result.rows[0].get("total"),
        Some(&serde_json::json!(300))
    );

    // Delete releases the table and the retained files
    engine.delete_source(&source.source_id).unwrap();
    assert!(engine.list_sources().is_empty());
    assert!(!dir
        .path()
        .join("sources")
        .join(&source.source_id)
        .exists());
}

#[test]
fn test_hostile_sql_never_reaches_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let source = engine.ingest_file(sales_csv(), "sales.csv").unwrap();
    let table = source.table_name.clone();

    let hostile = [
        format!("DROP TABLE {}", table),
        format!("/* harmless */ DELETE FROM {}", table),
        format!("-- note\nUPDATE {} SET revenue = 0", table),
        format!("SELECT 1; DROP TABLE {}", table),
        format!("WITH x AS (SELECT 1) INSERT INTO {} SELECT * FROM x", table),
    ];
    for sql in &hostile {
        let err = engine.execute_sql(&source.source_id, sql).unwrap_err();
        assert!(err.is_safety_rejection(), "accepted: {}", sql);
    }
    // Table still intact with its data
    let check = engine
        .execute_sql(&source.source_id, &format!("SELECT * FROM {}", table))
        .unwrap();
    assert_eq!(check.row_count, 4);
}

#[test]
fn test_chart_with_series_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let source = engine.ingest_file(sales_csv(), "sales.csv").unwrap();

    let chart = engine
        .build_and_run(&ChartSpec {
            source_id: source.source_id.clone(),
            x: "month".to_string(),
            y: Some(YAxis::One("revenue".to_string())),
            series: Some("region".to_string()),
            aggregation: Aggregation::Sum,
            time_grain: TimeGrain::Month,
        })
        .unwrap();

    // Two months times two regions
    assert_eq!(chart.result.row_count, 4);
    let east_january = chart
        .result
        .rows
        .iter()
        .find(|r| {
            r.get("region").and_then(|v| v.as_str()) == Some("east")
                && r.get("month")
                    .and_then(|v| v.as_str())
                    .map(|s| s.starts_with("2024-01"))
                    .unwrap_or(false)
        })
        .unwrap();
    assert_eq!(east_january.get("revenue"), Some(&serde_json::json!(100)));
}

#[test]
fn test_transform_then_chart() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let source = engine.ingest_file(sales_csv(), "sales.csv").unwrap();

    let renamed = engine
        .transform_source(
            &source.source_id,
            Transform::RenameColumn {
                from: "revenue".to_string(),
                to: "sales".to_string(),
            },
        )
        .unwrap();
    assert_eq!(renamed.source_id, source.source_id);
    assert!(renamed.column_names().contains(&"sales".to_string()));

    // The old name is gone from the chart path too
    let err = engine
        .build_chart_sql(&ChartSpec {
            source_id: source.source_id.clone(),
            x: "month".to_string(),
            y: Some(YAxis::One("revenue".to_string())),
            series: None,
            aggregation: Aggregation::Sum,
            time_grain: TimeGrain::None,
        })
        .unwrap_err();
    match err {
        EngineError::UnknownColumn { column, valid } => {
            assert_eq!(column, "revenue");
            assert!(valid.contains(&"sales".to_string()));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_rehydration_restores_sources() {
    let dir = tempfile::tempdir().unwrap();
    let (source_id, row_count) = {
        let engine = engine_in(dir.path());
        let source = engine.ingest_file(sales_csv(), "sales.csv").unwrap();
        (source.source_id, source.row_count)
    };

    // A fresh engine over the same data directory starts empty, then
    // restores from the retained files
    let engine = engine_in(dir.path());
    assert!(engine.list_sources().is_empty());
    let restored = engine.rehydrate().unwrap();
    assert_eq!(restored, 1);

    let source = engine.get_source(&source_id).unwrap();
    assert_eq!(source.row_count, row_count);
    let preview = engine.preview(&source_id, 10).unwrap();
    assert_eq!(preview.row_count, 4);
}

#[test]
fn test_parquet_sync_and_cache_serving() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let cache = dir.path().join("sync_cache");

    let df = df![
        "region" => ["east", "west", "east"],
        "revenue" => [100.0, 250.0, 75.5]
    ]
    .unwrap();

    let synced =
        connectors::sync_dataframe(engine.store(), df, "warehouse.sales", Some(&cache)).unwrap();
    assert_eq!(synced.row_count, 3);
    assert!(cache.join("warehouse_sales.parquet").exists());

    let source = engine.get_source(&synced.source_id).unwrap();
    assert_eq!(source.origin, SourceOrigin::Sync);

    // The cached copy now serves degraded mode without a remote
    let served = connectors::sync_from_cache(
        engine.store(),
        "warehouse.sales",
        &cache,
        &EngineError::ConnectorUnavailable("remote offline".to_string()),
    )
    .unwrap();
    assert_eq!(served.row_count, 3);
    assert_ne!(served.source_id, synced.source_id);
}

#[test]
fn test_failed_sync_leaves_no_source_and_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    // Parquet path that does not exist: table creation fails inside
    // the ingest step
    let missing = dir.path().join("ghost.parquet");
    let result = lumen_engine::sync::ingest_parquet(
        engine.store(),
        &missing,
        "ghost",
        SourceOrigin::Sync,
    );
    assert!(result.is_err());
    assert!(engine.list_sources().is_empty());

    // No stray files in the data directory beyond the expected layout
    let stray: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert!(stray.is_empty(), "stray files: {:?}", stray);
}

#[test]
fn test_sync_failure_after_columnar_write_cleans_up_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    // A regular file where the cache directory should go makes the
    // promotion step fail after the parquet temp file already exists
    let blocked_cache = dir.path().join("sync_cache");
    std::fs::write(&blocked_cache, b"in the way").unwrap();

    let df = df![
        "region" => ["east", "west"],
        "revenue" => [100.0, 250.0]
    ]
    .unwrap();
    let result =
        connectors::sync_dataframe(engine.store(), df, "warehouse.sales", Some(&blocked_cache));
    assert!(result.is_err());
    assert!(engine.list_sources().is_empty());

    // The temp parquet was deleted, not orphaned
    let leftovers: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("sync-"))
        .collect();
    assert!(leftovers.is_empty(), "orphaned temp files: {:?}", leftovers);
}

#[test]
fn test_source_id_gate_is_checked_at_every_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let bad = "src_x\"; DROP TABLE t; --";

    assert!(matches!(
        engine.get_source(bad),
        Err(EngineError::InvalidSourceId(_))
    ));
    assert!(matches!(
        engine.preview(bad, 10),
        Err(EngineError::InvalidSourceId(_))
    ));
    assert!(matches!(
        engine.distinct_values(bad, "a"),
        Err(EngineError::InvalidSourceId(_))
    ));
    assert!(matches!(
        engine.delete_source(bad),
        Err(EngineError::InvalidSourceId(_))
    ));
    assert!(matches!(
        engine.transform_source(
            bad,
            Transform::DeleteColumn {
                column: "a".to_string()
            }
        ),
        Err(EngineError::InvalidSourceId(_))
    ));
}
