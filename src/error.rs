use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid source id: {0}")]
    InvalidSourceId(String),

    #[error("Unknown column '{column}'. Valid columns: {}", .valid.join(", "))]
    UnknownColumn { column: String, valid: Vec<String> },

    #[error("Unsafe statement rejected: {0}")]
    UnsafeStatement(String),

    #[error("CSV parse failure: {0}")]
    ParseFailure(String),

    #[error("Connector authentication failed: {0}")]
    ConnectorAuth(String),

    #[error("Connector unavailable: {0}")]
    ConnectorUnavailable(String),

    #[error("Remote execution failed on {connector}: {detail}")]
    RemoteExecution { connector: String, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Ingestion error: {0}")]
    Ingest(String),

    #[error("Query build error: {0}")]
    QueryBuild(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<duckdb::Error> for EngineError {
    fn from(e: duckdb::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<polars::error::PolarsError> for EngineError {
    fn from(e: polars::error::PolarsError) -> Self {
        EngineError::Polars(e.to_string())
    }
}

impl EngineError {
    /// True for rejections produced by the safety validator, as opposed
    /// to failures raised by execution itself.
    pub fn is_safety_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::UnsafeStatement(_) | EngineError::InvalidSourceId(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
