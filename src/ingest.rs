//! CSV Ingestion Pipeline
//!
//! Turns uploaded bytes into a backing table. The declared filename
//! and the file contents are both attacker-controlled: the filename is
//! reduced to a safe basename, and the sniffed delimiter is
//! whitelisted before it is embedded in the `read_csv` options string.

use crate::error::{EngineError, Result};
use crate::profile::profile_table;
use crate::registry::{generate_source_id, Source, SourceOrigin};
use crate::safety::{self, validate_source_id};
use crate::store::Store;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Delimiters that may safely be embedded in a parse configuration.
const SAFE_DELIMITERS: [char; 5] = [',', '|', ';', '\t', ' '];

/// Bytes inspected when sniffing the delimiter.
const SNIFF_WINDOW: usize = 8 * 1024;

/// Guess the field delimiter from the first ~8 KB, then whitelist the
/// guess. A pathological sniffed delimiter silently falls back to
/// comma instead of reaching the parse configuration.
pub fn detect_delimiter(bytes: &[u8]) -> char {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let sample = String::from_utf8_lossy(window);

    // Count candidates over the first lines; ':' and '~' show up in
    // exported reports often enough to be worth sniffing, but they
    // never pass the whitelist below.
    let candidates = [',', '|', ';', '\t', ' ', ':', '~'];
    let mut best = (',', 0usize);
    if let Some(line) = sample.lines().find(|l| !l.trim().is_empty()) {
        for &cand in &candidates {
            let count = line.matches(cand).count();
            if count > best.1 {
                best = (cand, count);
            }
        }
    }

    let guess = best.0;
    if !consistent_field_counts(&sample, guess) {
        debug!(delimiter = %guess.escape_debug(), "sniffed delimiter gives uneven rows");
        return ',';
    }

    if SAFE_DELIMITERS.contains(&guess) {
        guess
    } else {
        warn!(delimiter = %guess.escape_debug(), "sniffed delimiter outside whitelist, using comma");
        ','
    }
}

/// Cross-check that the guessed delimiter yields a stable field count
/// over the sample.
fn consistent_field_counts(sample: &str, delimiter: char) -> bool {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(sample.as_bytes());

    let mut counts = Vec::new();
    for record in reader.records().take(10).flatten() {
        counts.push(record.len());
    }
    match counts.first() {
        None => false,
        Some(&first) => first > 0 && counts.iter().all(|&c| c == first),
    }
}

/// Reduce an attacker-controlled declared filename to a bare basename:
/// path separators and `..` segments never survive.
pub fn sanitize_filename(declared: &str) -> String {
    let normalized = declared.replace('\\', "/");
    let base = normalized
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .last()
        .unwrap_or("")
        .to_string();
    if base.is_empty() {
        "upload.csv".to_string()
    } else {
        base
    }
}

/// Ingest uploaded bytes as a new source.
pub fn ingest_csv(store: &Store, bytes: &[u8], declared_filename: &str) -> Result<Source> {
    let source_id = generate_source_id();
    let filename = sanitize_filename(declared_filename);
    let source_dir = store.config().sources_dir().join(&source_id);
    std::fs::create_dir_all(&source_dir)?;
    let file_path = source_dir.join(&filename);
    std::fs::write(&file_path, bytes)?;
    info!(source_id, filename, bytes = bytes.len(), "persisted upload");

    let delimiter = detect_delimiter(bytes);

    // Hold the engine lock across parse attempts and cleanup so the
    // rollback below can re-enter locked operations.
    let _guard = store.lock();
    match ingest_file_as(
        store,
        &file_path,
        &source_id,
        &filename,
        delimiter,
        SourceOrigin::Upload,
    ) {
        Ok(source) => Ok(source),
        Err(err) => {
            // Cleanup runs for every failure class, not just the
            // narrow parser error: drop the partial table, delete the
            // copied file, leave no registry entry.
            rollback(store, &source_id, Some(&source_dir));
            Err(err)
        }
    }
}

/// Parse a retained CSV file into the backing table for `source_id`,
/// profiling and registering it on success. Tries skipping 0..=N
/// leading rows to get past banner and metadata lines; success is
/// tracked with an explicit flag.
pub fn ingest_file_as(
    store: &Store,
    file_path: &Path,
    source_id: &str,
    display_name: &str,
    delimiter: char,
    origin: SourceOrigin,
) -> Result<Source> {
    validate_source_id(source_id)?;
    let table_name = safety::table_name_for(source_id)?;
    let max_skip = store.config().max_skip_rows;

    let path_literal = sql_string_literal(&file_path.to_string_lossy());
    let delim_literal = sql_string_literal(&delimiter.to_string());

    let mut parsed = false;
    let mut last_error = String::from("no parse attempts ran");

    for skip in 0..=max_skip {
        let sql = format!(
            "CREATE OR REPLACE TABLE {table} AS \
             SELECT * FROM read_csv({path}, delim = {delim}, skip = {skip}, header = true)",
            table = safety::quote_ident(&table_name, '"'),
            path = path_literal,
            delim = delim_literal,
            skip = skip,
        );

        match store.execute(&sql) {
            Ok(()) => {
                let columns = store.describe_table(&table_name)?;
                let rows = store.table_row_count(&table_name)?;
                if !columns.is_empty() && rows > 0 {
                    debug!(source_id, skip, rows, "parse attempt accepted");
                    parsed = true;
                    break;
                }
                last_error = format!("parsed with skip={} but produced an empty table", skip);
            }
            Err(e) => {
                last_error = e.to_string();
                debug!(source_id, skip, error = %last_error, "parse attempt failed");
            }
        }
    }

    if !parsed {
        return Err(EngineError::ParseFailure(format!(
            "no skip offset in 0..={} produced a usable table: {}",
            max_skip, last_error
        )));
    }

    let columns = profile_table(store, &table_name, store.config().sample_values)?;
    let row_count = store.table_row_count(&table_name)?;

    let source = Source {
        source_id: source_id.to_string(),
        origin,
        table_name,
        display_name: display_name.to_string(),
        ingested_at: Utc::now(),
        row_count,
        columns,
    };
    store.register_source(source.clone());
    info!(source_id, row_count, columns = source.columns.len(), "ingested source");
    Ok(source)
}

/// Drop any partial backing table and cached files for a failed
/// ingestion. Never fails: rollback is best-effort and logged.
pub fn rollback(store: &Store, source_id: &str, source_dir: Option<&Path>) {
    if let Ok(table) = safety::table_name_for(source_id) {
        if let Err(e) = store.drop_table(&table) {
            warn!(source_id, error = %e, "rollback: failed to drop partial table");
        }
    }
    if let Some(dir) = source_dir {
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                warn!(source_id, error = %e, "rollback: failed to delete upload copy");
            }
        }
    }
}

/// Re-ingest every retained per-source directory after a restart.
/// Directories whose name does not match the id pattern are logged and
/// skipped, never ingested. Returns the number of rehydrated sources.
pub fn rehydrate(store: &Store) -> Result<usize> {
    let sources_dir = store.config().sources_dir();
    if !sources_dir.exists() {
        return Ok(0);
    }

    let mut restored = 0;
    for entry in std::fs::read_dir(&sources_dir)? {
        let entry = entry?;
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if validate_source_id(&dir_name).is_err() {
            warn!(directory = %dir_name, "skipping directory with invalid source id");
            continue;
        }
        let Some(file_path) = first_file_in(&entry.path())? else {
            warn!(source_id = %dir_name, "retained directory holds no file, skipping");
            continue;
        };

        let bytes = std::fs::read(&file_path)?;
        let delimiter = detect_delimiter(&bytes);
        let display_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir_name.clone());

        let _guard = store.lock();
        match ingest_file_as(
            store,
            &file_path,
            &dir_name,
            &display_name,
            delimiter,
            SourceOrigin::Upload,
        ) {
            Ok(_) => restored += 1,
            Err(e) => {
                // Keep the retained file for diagnosis, but leave no
                // partial table or registry entry behind.
                rollback(store, &dir_name, None);
                warn!(source_id = %dir_name, error = %e, "failed to rehydrate source");
            }
        }
    }
    info!(restored, "rehydration complete");
    Ok(restored)
}

fn first_file_in(dir: &Path) -> Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Single-quoted SQL string literal with embedded quotes doubled.
fn sql_string_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn store_in(dir: &Path) -> Store {
        Store::open(EngineConfig::with_data_dir(dir)).unwrap()
    }

    #[test]
    fn test_detect_delimiter_variants() {
        assert_eq!(detect_delimiter(b"a,b,c\n1,2,3\n"), ',');
        assert_eq!(detect_delimiter(b"a|b|c\n1|2|3\n"), '|');
        assert_eq!(detect_delimiter(b"a;b;c\n1;2;3\n"), ';');
        assert_eq!(detect_delimiter(b"a\tb\tc\n1\t2\t3\n"), '\t');
    }

    #[test]
    fn test_delimiter_whitelist_fallback() {
        // ':' wins the sniff but is not in the safe set
        assert_eq!(detect_delimiter(b"a:b:c\n1:2:3\n"), ',');
        assert_eq!(detect_delimiter(b"a~b~c\n1~2~3\n"), ',');
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.csv"), "report.csv");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/sub/data.csv"), "data.csv");
        assert_eq!(sanitize_filename("c:\\temp\\x.csv"), "x.csv");
        assert_eq!(sanitize_filename("...."), "upload.csv");
        assert_eq!(sanitize_filename(""), "upload.csv");
    }

    #[test]
    fn test_ingest_simple_csv() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let source = ingest_csv(&store, b"name,age\nAlice,30\nBob,25", "people.csv").unwrap();

        assert_eq!(source.row_count, 2);
        assert_eq!(source.columns.len(), 2);
        let age = source.columns.iter().find(|c| c.name == "age").unwrap();
        assert!(age.data_type.to_uppercase().contains("INT"));
    }

    #[test]
    fn test_banner_rows_within_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        // Exactly five banner lines before the real header. They hold
        // no delimiter at all, so every parse attempt that includes one
        // of them sees inconsistent field counts and fails.
        let mut csv = String::new();
        for i in 0..5 {
            csv.push_str(&format!("banner{}\n", i));
        }
        csv.push_str("name,age\nAlice,30\n");

        let source = ingest_csv(&store, csv.as_bytes(), "banner.csv").unwrap();
        assert_eq!(source.row_count, 1);
        assert_eq!(source.columns.len(), 2);
    }

    #[test]
    fn test_banner_rows_beyond_retry_budget_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        // Six banner lines need skip=6, one past the retry budget, so
        // every attempt sees a delimiter-free banner line mixed with
        // two-field data rows and fails.
        let mut csv = String::new();
        for i in 0..6 {
            csv.push_str(&format!("banner{}\n", i));
        }
        csv.push_str("name,age\nAlice,30\n");

        let result = ingest_csv(&store, csv.as_bytes(), "deep_banner.csv");
        assert!(matches!(result, Err(EngineError::ParseFailure(_))));
        assert!(store.list_sources().is_empty());
    }

    #[test]
    fn test_failed_ingest_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let result = ingest_csv(&store, b"", "empty.csv");
        assert!(result.is_err());
        assert!(store.list_sources().is_empty());

        // No per-source directory survives the rollback
        let sources_dir = store.config().sources_dir();
        let leftover = std::fs::read_dir(&sources_dir)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_rehydrate_skips_invalid_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let sources_dir = store.config().sources_dir();

        // One valid retained source
        let id = generate_source_id();
        let good = sources_dir.join(&id);
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(good.join("data.csv"), b"a,b\n1,2\n").unwrap();

        // One directory with a non-conforming name
        let bad = sources_dir.join("not-a-source-id");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("data.csv"), b"a,b\n1,2\n").unwrap();

        let restored = rehydrate(&store).unwrap();
        assert_eq!(restored, 1);
        assert!(store.lookup_source(&id).is_ok());
    }
}
