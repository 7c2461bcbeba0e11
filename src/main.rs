use anyhow::Result;
use clap::{Parser, Subcommand};
use lumen_engine::config::EngineConfig;
use lumen_engine::query_builder::{Aggregation, ChartSpec, TimeGrain, YAxis};
use lumen_engine::Engine;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Embedded analytical data engine")]
struct Args {
    /// Path to the data directory (default: ./data)
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a local CSV file as a new source
    Ingest { file: PathBuf },

    /// List all registered sources
    Sources,

    /// Show the first rows of a source
    Preview {
        source_id: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Run a read-only SQL statement against a source
    Query { source_id: String, sql: String },

    /// Build and run an aggregated chart query
    Chart {
        source_id: String,
        #[arg(short, long)]
        x: String,
        #[arg(short, long)]
        y: Vec<String>,
        #[arg(short, long, default_value = "sum")]
        aggregation: String,
        #[arg(short, long, default_value = "none")]
        grain: String,
    },

    /// Delete a source and its backing table
    Delete { source_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let engine = Engine::open(EngineConfig::with_data_dir(&args.data_dir))?;
    let restored = engine.rehydrate()?;
    if restored > 0 {
        info!(restored, "restored retained sources");
    }

    match args.command {
        Command::Ingest { file } => {
            let bytes = std::fs::read(&file)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload.csv".to_string());
            let source = engine.ingest_file(&bytes, &name)?;
            println!(
                "✅ ingested {} as {} ({} rows, {} columns)",
                name,
                source.source_id,
                source.row_count,
                source.columns.len()
            );
        }
        Command::Sources => {
            for source in engine.list_sources() {
                println!(
                    "{}  {:>8} rows  [{}]  {}",
                    source.source_id,
                    source.row_count,
                    source.origin.as_str(),
                    source.display_name
                );
            }
        }
        Command::Preview { source_id, limit } => {
            let result = engine.preview(&source_id, limit)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Query { source_id, sql } => {
            let result = engine.execute_sql(&source_id, &sql)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.truncated {
                eprintln!("⚠️  result truncated at {} rows", result.row_count);
            }
        }
        Command::Chart {
            source_id,
            x,
            y,
            aggregation,
            grain,
        } => {
            let spec = ChartSpec {
                source_id,
                x,
                y: if y.is_empty() {
                    None
                } else {
                    Some(YAxis::Many(y))
                },
                series: None,
                aggregation: parse_enum::<Aggregation>(&aggregation)?,
                time_grain: parse_enum::<TimeGrain>(&grain)?,
            };
            let chart = engine.build_and_run(&spec)?;
            println!("-- {}", chart.sql);
            println!("{}", serde_json::to_string_pretty(&chart.result)?);
        }
        Command::Delete { source_id } => {
            let removed = engine.delete_source(&source_id)?;
            println!("🗑️  deleted {} ({})", removed.source_id, removed.display_name);
        }
    }

    Ok(())
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|_| anyhow::anyhow!("unrecognized value '{}'", raw))
}
