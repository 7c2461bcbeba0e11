//! Query Builder
//!
//! Turns a structured chart specification (axes, aggregation, time
//! grain) into validated SQL text. Pure: column validation happens
//! against the live column set passed in, and only validated
//! identifiers ever reach the SQL string.

use crate::error::{EngineError, Result};
use crate::safety::quote_ident;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    None,
    Sum,
    Avg,
    Median,
    Count,
    Min,
    Max,
}

impl Aggregation {
    fn sql_name(&self) -> &'static str {
        match self {
            Aggregation::None => "",
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Median => "MEDIAN",
            Aggregation::Count => "COUNT",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    None,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    fn sql_name(&self) -> &'static str {
        match self {
            TimeGrain::None => "",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }
}

/// Y axis input: a scalar or a list, as the UI sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YAxis {
    One(String),
    Many(Vec<String>),
}

impl YAxis {
    fn into_vec(self) -> Vec<String> {
        match self {
            YAxis::One(y) => vec![y],
            YAxis::Many(ys) => ys,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSpec {
    pub source_id: String,
    pub x: String,
    #[serde(default)]
    pub y: Option<YAxis>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default = "default_aggregation")]
    pub aggregation: Aggregation,
    #[serde(default = "default_time_grain")]
    pub time_grain: TimeGrain,
}

fn default_aggregation() -> Aggregation {
    Aggregation::None
}

fn default_time_grain() -> TimeGrain {
    TimeGrain::None
}

/// The SQL plus the values that were actually validated into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltQuery {
    pub sql: String,
    pub x: String,
    pub y: Vec<String>,
    pub series: Option<String>,
    pub aggregated: bool,
}

/// Hard caps for built queries. Raw selects get the smaller cap; a
/// grouped aggregate may legitimately return more rows.
#[derive(Debug, Clone, Copy)]
pub struct RowCaps {
    pub raw: usize,
    pub agg: usize,
}

fn require_column(columns: &[String], name: &str) -> Result<()> {
    if columns.iter().any(|c| c == name) {
        Ok(())
    } else {
        let mut valid = columns.to_vec();
        valid.sort();
        Err(EngineError::UnknownColumn {
            column: name.to_string(),
            valid,
        })
    }
}

/// Build validated SQL for a chart spec against a known column set.
pub fn build_query(
    spec: &ChartSpec,
    table_name: &str,
    columns: &[String],
    caps: RowCaps,
) -> Result<BuiltQuery> {
    require_column(columns, &spec.x)?;
    if let Some(series) = &spec.series {
        require_column(columns, series)?;
    }

    // Normalize y: an empty list means "no y", a single-element list
    // collapses to the scalar path.
    let y: Vec<String> = spec.y.clone().map(YAxis::into_vec).unwrap_or_default();
    for col in &y {
        require_column(columns, col)?;
    }

    let aggregated = spec.aggregation != Aggregation::None;
    if y.is_empty() && aggregated && spec.aggregation != Aggregation::Count {
        // SUM(*) / AVG(*) are not valid SQL
        return Err(EngineError::QueryBuild(format!(
            "{}() requires a Y column",
            spec.aggregation.sql_name()
        )));
    }

    let table = quote_ident(table_name, '"');
    let x_q = quote_ident(&spec.x, '"');
    let series_q = spec.series.as_ref().map(|s| quote_ident(s, '"'));

    // The grain only applies when both a grain and a real aggregation
    // are requested; otherwise the raw x value passes through.
    let grain_applies = spec.time_grain != TimeGrain::None && aggregated;
    let x_expr = if grain_applies {
        format!(
            "DATE_TRUNC('{}', {x}) AS {x}",
            spec.time_grain.sql_name(),
            x = x_q
        )
    } else {
        x_q.clone()
    };

    let sql = match y.len() {
        0 | 1 => build_single_y(
            &table, &x_expr, &x_q, y.first(), &series_q, spec.aggregation, caps,
        ),
        _ => build_multi_y(&table, &x_expr, &x_q, &y, &series_q, spec.aggregation, caps),
    };

    Ok(BuiltQuery {
        sql,
        x: spec.x.clone(),
        y,
        series: spec.series.clone(),
        aggregated,
    })
}

fn build_single_y(
    table: &str,
    x_expr: &str,
    x_q: &str,
    y: Option<&String>,
    series_q: &Option<String>,
    aggregation: Aggregation,
    caps: RowCaps,
) -> String {
    let y_q = y.map(|c| quote_ident(c, '"'));

    if aggregation == Aggregation::None {
        // Raw path: no grouping, smaller cap
        let mut select = vec![x_q.to_string()];
        if let Some(y_q) = &y_q {
            select.push(y_q.clone());
        }
        if let Some(series) = series_q {
            select.push(series.clone());
        }
        return format!(
            "SELECT {} FROM {} LIMIT {}",
            select.join(", "),
            table,
            caps.raw
        );
    }

    let value_expr = match &y_q {
        Some(y_q) => format!("{}({}) AS {}", aggregation.sql_name(), y_q, y_q),
        // count is the one aggregation valid without a y column
        None => "COUNT(*) AS \"count\"".to_string(),
    };

    let mut select = vec![x_expr.to_string()];
    let mut group_by = vec![x_q.to_string()];
    if let Some(series) = series_q {
        select.push(series.clone());
        group_by.push(series.clone());
    }
    select.push(value_expr);

    format!(
        "SELECT {} FROM {} GROUP BY {} ORDER BY {} LIMIT {}",
        select.join(", "),
        table,
        group_by.join(", "),
        x_q,
        caps.agg
    )
}

/// Wide-to-long reshape: N value columns become (metric, value) row
/// pairs via UNION ALL. The row cap on both branches is a correctness
/// property, not an optimization: an unbounded reshape multiplies row
/// count by the number of measures.
fn build_multi_y(
    table: &str,
    x_expr: &str,
    x_q: &str,
    y: &[String],
    series_q: &Option<String>,
    aggregation: Aggregation,
    caps: RowCaps,
) -> String {
    let arms = y
        .iter()
        .map(|col| {
            let y_q = quote_ident(col, '"');
            let metric_literal = format!("'{}'", col.replace('\'', "''"));
            let mut select = vec![x_expr.to_string()];
            if let Some(series) = series_q {
                // The series column must survive the reshape
                select.push(series.clone());
            }
            select.push(format!("{} AS \"metric\"", metric_literal));
            select.push(format!("{} AS \"value\"", y_q));
            format!("SELECT {} FROM {}", select.join(", "), table)
        })
        .join(" UNION ALL ");

    if aggregation == Aggregation::None {
        return format!(
            "SELECT * FROM ({}) AS reshaped LIMIT {}",
            arms, caps.raw
        );
    }

    let mut select = vec![x_q.to_string()];
    let mut group_by = vec![x_q.to_string()];
    if let Some(series) = series_q {
        select.push(series.clone());
        group_by.push(series.clone());
    }
    select.push("\"metric\"".to_string());
    group_by.push("\"metric\"".to_string());
    select.push(format!(
        "{}(\"value\") AS \"value\"",
        aggregation.sql_name()
    ));

    format!(
        "SELECT {} FROM ({}) AS reshaped GROUP BY {} ORDER BY {} LIMIT {}",
        select.join(", "),
        arms,
        group_by.join(", "),
        x_q,
        caps.agg
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: RowCaps = RowCaps {
        raw: 5_000,
        agg: 10_000,
    };

    fn columns() -> Vec<String> {
        ["month", "region", "revenue", "cost"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn spec(y: Option<YAxis>, aggregation: Aggregation, time_grain: TimeGrain) -> ChartSpec {
        ChartSpec {
            source_id: "abcdef012345".to_string(),
            x: "month".to_string(),
            y,
            series: None,
            aggregation,
            time_grain,
        }
    }

    #[test]
    fn test_unknown_column_reports_sorted_valid_set() {
        let bad = spec(
            Some(YAxis::One("profit".to_string())),
            Aggregation::Sum,
            TimeGrain::None,
        );
        let err = build_query(&bad, "src_abcdef012345", &columns(), CAPS).unwrap_err();
        match err {
            EngineError::UnknownColumn { column, valid } => {
                assert_eq!(column, "profit");
                assert_eq!(valid, vec!["cost", "month", "region", "revenue"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_aggregation_without_y_is_rejected() {
        let bad = spec(None, Aggregation::Sum, TimeGrain::None);
        let err = build_query(&bad, "t", &columns(), CAPS).unwrap_err();
        assert!(err.to_string().contains("SUM() requires a Y column"));
    }

    #[test]
    fn test_count_without_y_becomes_count_star() {
        let q = build_query(
            &spec(None, Aggregation::Count, TimeGrain::None),
            "t",
            &columns(),
            CAPS,
        )
        .unwrap();
        assert!(q.sql.contains("COUNT(*)"));
        assert!(q.sql.contains("GROUP BY"));
    }

    #[test]
    fn test_single_element_list_collapses_to_scalar_path() {
        let q = build_query(
            &spec(
                Some(YAxis::Many(vec!["revenue".to_string()])),
                Aggregation::None,
                TimeGrain::None,
            ),
            "t",
            &columns(),
            CAPS,
        )
        .unwrap();
        assert!(!q.sql.contains("UNION ALL"));
        assert!(q.sql.ends_with(&format!("LIMIT {}", CAPS.raw)));
    }

    #[test]
    fn test_grain_needs_aggregation() {
        // Grain without aggregation: raw x passes through unmodified
        let raw = build_query(
            &spec(
                Some(YAxis::One("revenue".to_string())),
                Aggregation::None,
                TimeGrain::Month,
            ),
            "t",
            &columns(),
            CAPS,
        )
        .unwrap();
        assert!(!raw.sql.contains("DATE_TRUNC"));

        let aggregated = build_query(
            &spec(
                Some(YAxis::One("revenue".to_string())),
                Aggregation::Sum,
                TimeGrain::Month,
            ),
            "t",
            &columns(),
            CAPS,
        )
        .unwrap();
        assert!(aggregated
            .sql
            .contains("DATE_TRUNC('month', \"month\") AS \"month\""));
    }

    #[test]
    fn test_multi_y_reshape_shape() {
        // Scenario: sum of revenue and cost by month
        let q = build_query(
            &spec(
                Some(YAxis::Many(vec![
                    "revenue".to_string(),
                    "cost".to_string(),
                ])),
                Aggregation::Sum,
                TimeGrain::Month,
            ),
            "src_abcdef012345",
            &columns(),
            CAPS,
        )
        .unwrap();

        assert!(q.sql.contains("UNION ALL"));
        assert!(q.sql.contains("'revenue'"));
        assert!(q.sql.contains("'cost'"));
        assert!(q.sql.contains("GROUP BY \"month\", \"metric\""));
        assert!(q.sql.ends_with(&format!("LIMIT {}", CAPS.agg)));
    }

    #[test]
    fn test_multi_y_has_exactly_one_limit() {
        for aggregation in [Aggregation::None, Aggregation::Sum] {
            let q = build_query(
                &spec(
                    Some(YAxis::Many(vec![
                        "revenue".to_string(),
                        "cost".to_string(),
                    ])),
                    aggregation,
                    TimeGrain::None,
                ),
                "t",
                &columns(),
                CAPS,
            )
            .unwrap();
            assert_eq!(q.sql.matches("LIMIT").count(), 1, "sql: {}", q.sql);
        }
    }

    #[test]
    fn test_series_survives_the_reshape() {
        let mut s = spec(
            Some(YAxis::Many(vec![
                "revenue".to_string(),
                "cost".to_string(),
            ])),
            Aggregation::Sum,
            TimeGrain::None,
        );
        s.series = Some("region".to_string());
        let q = build_query(&s, "t", &columns(), CAPS).unwrap();

        // Present in every reshape arm and in the group by
        assert!(q.sql.matches("\"region\"").count() >= 3, "sql: {}", q.sql);
        assert!(q.sql.contains("GROUP BY \"month\", \"region\", \"metric\""));
    }

    #[test]
    fn test_spec_deserializes_scalar_and_list_y() {
        let scalar: ChartSpec = serde_json::from_str(
            r#"{"source_id":"abcdef012345","x":"month","y":"revenue","aggregation":"sum","time_grain":"none"}"#,
        )
        .unwrap();
        assert!(matches!(scalar.y, Some(YAxis::One(_))));

        let list: ChartSpec = serde_json::from_str(
            r#"{"source_id":"abcdef012345","x":"month","y":["revenue","cost"],"aggregation":"avg","time_grain":"month"}"#,
        )
        .unwrap();
        assert!(matches!(list.y, Some(YAxis::Many(_))));
    }
}
