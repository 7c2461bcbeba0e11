//! SQL Safety Validator
//!
//! Pure, stateless checks shared by every execution path: built chart
//! queries, ad-hoc user SQL, and LLM-proposed SQL all go through the
//! same gate with no elevated trust for any origin.

use crate::error::{EngineError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SOURCE_ID_RE: Regex = Regex::new(r"^[a-f0-9]{12}$").unwrap();
    static ref FORBIDDEN_RE: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|GRANT|REVOKE)\b"
    )
    .unwrap();
}

const ALLOWED_FIRST_KEYWORDS: [&str; 3] = ["SELECT", "WITH", "EXPLAIN"];

/// Strip any run of leading block comments (`/* ... */`) and line
/// comments (`-- ...`), so a comment cannot hide the first keyword.
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(idx) => after[idx + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(idx) => after[idx + 2..].trim_start(),
                // Unterminated block comment swallows the rest
                None => "",
            };
        } else {
            return rest;
        }
    }
}

fn first_keyword(sql: &str) -> Option<String> {
    strip_leading_comments(sql)
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .find(|tok| !tok.is_empty())
        .map(|tok| tok.to_ascii_uppercase())
}

/// Reject anything that is not a single read-only statement.
///
/// Idempotent: running the check twice on the same text yields the same
/// verdict both times.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let keyword = first_keyword(sql)
        .ok_or_else(|| EngineError::UnsafeStatement("empty statement".to_string()))?;

    if !ALLOWED_FIRST_KEYWORDS.contains(&keyword.as_str()) {
        return Err(EngineError::UnsafeStatement(format!(
            "statement must start with SELECT, WITH or EXPLAIN (found {})",
            keyword
        )));
    }

    if let Some(m) = FORBIDDEN_RE.find(sql) {
        return Err(EngineError::UnsafeStatement(format!(
            "disallowed keyword {} in statement",
            m.as_str().to_ascii_uppercase()
        )));
    }

    Ok(())
}

/// Remove every semicolon from an ad-hoc statement before execution,
/// preventing statement stacking.
pub fn strip_semicolons(sql: &str) -> String {
    sql.replace(';', "")
}

/// The single choke point before a `source_id` becomes part of a table
/// name. Any string not matching the generation scheme is rejected.
pub fn validate_source_id(source_id: &str) -> Result<&str> {
    if SOURCE_ID_RE.is_match(source_id) {
        Ok(source_id)
    } else {
        Err(EngineError::InvalidSourceId(source_id.to_string()))
    }
}

/// Backing table name for a validated source id.
pub fn table_name_for(source_id: &str) -> Result<String> {
    validate_source_id(source_id)?;
    Ok(format!("src_{}", source_id))
}

/// Quote an identifier with the target dialect's quote character,
/// doubling any embedded quote characters.
pub fn quote_ident(name: &str, quote: char) -> String {
    let doubled = name.replace(quote, &format!("{}{}", quote, quote));
    format!("{}{}{}", quote, doubled, quote)
}

/// Wrap a caller statement in an outer bounding subquery. The server
/// cap is authoritative; any LIMIT the caller embedded only applies
/// inside the subquery.
pub fn bounded(sql: &str, limit: usize) -> String {
    let inner = strip_semicolons(sql);
    format!(
        "SELECT * FROM ({}) AS bounded_query LIMIT {}",
        inner.trim(),
        limit
    )
}
