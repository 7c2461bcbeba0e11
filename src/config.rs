//! Engine configuration
//!
//! Row caps are the backpressure mechanism: every externally reachable
//! query path is bounded by one of these regardless of what the caller
//! asked for.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for cached uploads and synced parquet files
    pub data_dir: PathBuf,

    /// Hard cap for unaggregated chart queries
    pub raw_row_cap: usize,

    /// Hard cap for aggregated chart queries
    pub agg_row_cap: usize,

    /// Hard cap for ad-hoc SQL (user or LLM supplied)
    pub adhoc_row_cap: usize,

    /// Sample values collected per column profile
    pub sample_values: usize,

    /// Maximum leading rows skipped while retrying a CSV parse
    pub max_skip_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            raw_row_cap: 5_000,
            agg_row_cap: 10_000,
            adhoc_row_cap: 10_000,
            sample_values: 5,
            max_skip_rows: 5,
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding the per-source upload copies
    pub fn sources_dir(&self) -> PathBuf {
        self.data_dir.join("sources")
    }

    /// Directory holding the permanent parquet cache for connector syncs
    pub fn sync_cache_dir(&self) -> PathBuf {
        self.data_dir.join("sync_cache")
    }
}
