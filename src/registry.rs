//! Source Registry
//!
//! Single source of truth for "what exists". A `Source` is only
//! observable here once its backing table exists with at least one
//! column and one row; there is no half-registered state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a source entered the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceOrigin {
    Upload,
    Sync,
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::Upload => "upload",
            SourceOrigin::Sync => "sync",
        }
    }
}

/// Column-level statistics, recomputed wholesale on every re-ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub sample_values: Vec<serde_json::Value>,
    pub null_count: usize,
    pub distinct_count: usize,
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
}

/// A registered, queryable dataset addressable by an opaque id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Fixed-length lowercase-hex identifier, generated, never
    /// user-supplied for creation
    pub source_id: String,
    pub origin: SourceOrigin,
    /// Backing table inside the embedded store
    pub table_name: String,
    /// Original filename or remote table name
    pub display_name: String,
    pub ingested_at: DateTime<Utc>,
    pub row_count: usize,
    pub columns: Vec<ColumnProfile>,
}

impl Source {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// In-memory registry. Mutations happen only while the shared engine
/// lock is held; the owning store enforces that by keeping this inside
/// its locked inner state.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Source>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Source) {
        self.sources.insert(source.source_id.clone(), source);
    }

    pub fn lookup(&self, source_id: &str) -> Option<&Source> {
        self.sources.get(source_id)
    }

    pub fn remove(&mut self, source_id: &str) -> Option<Source> {
        self.sources.remove(source_id)
    }

    pub fn list(&self) -> Vec<Source> {
        let mut all: Vec<Source> = self.sources.values().cloned().collect();
        all.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at));
        all
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Generate a fresh 12-character lowercase-hex source id.
pub fn generate_source_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..6).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}
