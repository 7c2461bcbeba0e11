pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod profile;
pub mod query_builder;
pub mod registry;
pub mod safety;
pub mod store;
pub mod sync;
pub mod transform;

pub use engine::Engine;
pub use error::{EngineError, Result};
