//! Windowed count queries for aggregation rules.
//!
//! Queries run against the per-rule relation `Matches`, one row per
//! candidate event in the rule's window, with one column per event field.
//! Any row returned means the threshold is crossed.

use vigil_rules::ConditionOperator;

/// Relation holding a rule's windowed candidates.
pub const MATCHES_TABLE: &str = "Matches";

/// Returns no rows regardless of the window's contents.
pub const EMPTY_QUERY: &str = "SELECT 0 AS Count WHERE 0 = 1";

/// Build the threshold query.
///
/// `contains_column` reports whether the store has a column for a field.
/// A missing distinct property, or grouping dimensions none of which exist,
/// yield [`EMPTY_QUERY`] so an unknown column never degrades into an
/// unfiltered total.
pub fn build_query(
    operator: ConditionOperator,
    threshold: i64,
    property: Option<&str>,
    dimensions: &[String],
    contains_column: impl Fn(&str) -> bool,
) -> String {
    let count = match property {
        Some(p) if !contains_column(p) => return EMPTY_QUERY.to_string(),
        Some(p) => format!("COUNT(DISTINCT {})", quote_ident(p)),
        None => "COUNT(*)".to_string(),
    };
    let having = format!("HAVING Count {} {threshold}", sql_operator(operator));

    if dimensions.is_empty() {
        return format!("SELECT {count} AS Count FROM {MATCHES_TABLE} {having}");
    }

    let present: Vec<String> = dimensions
        .iter()
        .filter(|d| contains_column(d))
        .map(|d| quote_ident(d))
        .collect();
    if present.is_empty() {
        return EMPTY_QUERY.to_string();
    }
    let group = present.join(", ");
    format!("SELECT {group}, {count} AS Count FROM {MATCHES_TABLE} GROUP BY {group} {having}")
}

fn sql_operator(op: ConditionOperator) -> &'static str {
    match op {
        ConditionOperator::Eq => "=",
        other => other.symbol(),
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
