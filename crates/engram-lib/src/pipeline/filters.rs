//! Recall filter parsing: a dynamic filter map plus legacy top-level
//! parameters become one SQL predicate over the `memories` table.

#![allow(clippy::cast_possible_truncation)]

use serde_json::Value;
use tracing::warn;

use crate::db::store::{Predicate, SqlValue};
use crate::error::{EngramError, Result};

/// Filter keys the engine understands; anything else is ignored with a
/// warning.
const ALLOWED_FILTERS: &[&str] = &[
    "collection",
    "min_importance",
    "since",
    "before",
    "after_timestamp",
    "before_timestamp",
    "source",
    "session_id",
    "tags",
    "text_like",
];

/// Options accepted by `recall`. The `filters` map mirrors the dynamic
/// filter dictionary of the wire interface; the named fields are the legacy
/// top-level parameters, which win when both are present.
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub collection: Option<String>,
    pub topk: Option<usize>,
    pub filters: Option<serde_json::Map<String, Value>>,
    pub min_importance: Option<f64>,
    pub since: Option<String>,
    pub before: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Parse a relative duration (`Nm`, `Nh`, `Nd`, `Nw`) into seconds.
pub fn parse_duration_secs(spec: &str) -> Result<i64> {
    let spec = spec.trim();
    let Some(unit) = spec.chars().last() else {
        return Err(EngramError::Search(format!("invalid duration: {spec:?}")));
    };
    let number = &spec[..spec.len() - unit.len_utf8()];
    let value: i64 = number
        .parse()
        .map_err(|_| EngramError::Search(format!("invalid duration: {spec:?}")))?;
    let multiplier = match unit {
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return Err(EngramError::Search(format!("invalid duration unit: {spec:?}"))),
    };
    Ok(value * multiplier)
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// Build the SQL predicate for a recall call.
///
/// `now` is the wall-clock second used to resolve relative durations, passed
/// in so results are stable within one call.
pub fn build_predicate(options: &RecallOptions, now: i64) -> Result<Predicate> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    let filters = options.filters.as_ref();

    if let Some(filters) = filters {
        for key in filters.keys() {
            if !ALLOWED_FILTERS.contains(&key.as_str()) {
                warn!(key = %key, "Ignoring invalid filter key");
            }
        }
    }

    let filter_str = |key: &str| -> Option<String> {
        filters
            .and_then(|f| f.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    // Legacy top-level parameters take precedence over filter-map keys.
    if let Some(collection) = options
        .collection
        .clone()
        .or_else(|| filter_str("collection"))
    {
        clauses.push("m.collection = ?".to_string());
        values.push(SqlValue::Text(collection));
    }

    if let Some(min_importance) = options
        .min_importance
        .or_else(|| filters.and_then(|f| f.get("min_importance")).and_then(as_f64))
    {
        // Supplying the key always filters, even at 0.0.
        clauses.push("m.importance >= ?".to_string());
        values.push(SqlValue::Real(min_importance));
    }

    if let Some(since) = options.since.clone().or_else(|| filter_str("since")) {
        clauses.push("m.timestamp >= ?".to_string());
        values.push(SqlValue::Int(now - parse_duration_secs(&since)?));
    }

    if let Some(before) = options.before.clone().or_else(|| filter_str("before")) {
        clauses.push("m.timestamp <= ?".to_string());
        values.push(SqlValue::Int(now - parse_duration_secs(&before)?));
    }

    if let Some(filters) = filters {
        if let Some(after) = filters.get("after_timestamp").and_then(as_i64) {
            clauses.push("m.timestamp >= ?".to_string());
            values.push(SqlValue::Int(after));
        }
        if let Some(before) = filters.get("before_timestamp").and_then(as_i64) {
            clauses.push("m.timestamp <= ?".to_string());
            values.push(SqlValue::Int(before));
        }
        if let Some(source) = filters.get("source").and_then(Value::as_str) {
            clauses.push("m.source = ?".to_string());
            values.push(SqlValue::Text(source.to_string()));
        }
        if let Some(session_id) = filters.get("session_id").and_then(Value::as_str) {
            clauses.push("m.session_id = ?".to_string());
            values.push(SqlValue::Text(session_id.to_string()));
        }
        if let Some(tags_value) = filters.get("tags") {
            let tags: Vec<String> = match tags_value {
                Value::String(tag) => vec![tag.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            if !tags.is_empty() {
                // Substring match on the comma-joined tag column: any tag
                // matches.
                let tag_clauses: Vec<String> =
                    tags.iter().map(|_| "m.tags LIKE ?".to_string()).collect();
                clauses.push(format!("({})", tag_clauses.join(" OR ")));
                for tag in tags {
                    values.push(SqlValue::Text(format!("%{tag}%")));
                }
            }
        }
        if let Some(needle) = filters.get("text_like").and_then(Value::as_str) {
            clauses.push("m.text LIKE ?".to_string());
            values.push(SqlValue::Text(format!("%{needle}%")));
        }
    }

    if clauses.is_empty() {
        Ok(Predicate::always())
    } else {
        Ok(Predicate {
            clause: clauses.join(" AND "),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters_from(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn empty_options_build_trivial_predicate() {
        let predicate = build_predicate(&RecallOptions::default(), 1_000).unwrap();
        assert!(predicate.is_trivial());
        assert!(predicate.values.is_empty());
    }

    #[test]
    fn legacy_collection_wins_over_filter_map() {
        let options = RecallOptions {
            collection: Some("legacy".to_string()),
            filters: Some(filters_from(json!({"collection": "mapped"}))),
            ..Default::default()
        };
        let predicate = build_predicate(&options, 1_000).unwrap();
        assert_eq!(predicate.clause, "m.collection = ?");
        assert!(matches!(&predicate.values[0], SqlValue::Text(c) if c == "legacy"));
    }

    #[test]
    fn since_resolves_relative_to_now() {
        let options = RecallOptions {
            since: Some("30d".to_string()),
            ..Default::default()
        };
        let now = 100 * 86_400;
        let predicate = build_predicate(&options, now).unwrap();
        assert_eq!(predicate.clause, "m.timestamp >= ?");
        assert!(matches!(predicate.values[0], SqlValue::Int(t) if t == now - 30 * 86_400));
    }

    #[test]
    fn min_importance_zero_still_filters() {
        let options = RecallOptions {
            min_importance: Some(0.0),
            ..Default::default()
        };
        let predicate = build_predicate(&options, 0).unwrap();
        assert_eq!(predicate.clause, "m.importance >= ?");
    }

    #[test]
    fn tags_match_any() {
        let options = RecallOptions {
            filters: Some(filters_from(json!({"tags": ["work", "urgent"]}))),
            ..Default::default()
        };
        let predicate = build_predicate(&options, 0).unwrap();
        assert_eq!(predicate.clause, "(m.tags LIKE ? OR m.tags LIKE ?)");
        assert_eq!(predicate.values.len(), 2);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let options = RecallOptions {
            filters: Some(filters_from(json!({"frobnicate": true, "source": "cli"}))),
            ..Default::default()
        };
        let predicate = build_predicate(&options, 0).unwrap();
        assert_eq!(predicate.clause, "m.source = ?");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_secs("30m").unwrap(), 1_800);
        assert_eq!(parse_duration_secs("24h").unwrap(), 86_400);
        assert_eq!(parse_duration_secs("7d").unwrap(), 7 * 86_400);
        assert_eq!(parse_duration_secs("2w").unwrap(), 2 * 604_800);
        assert!(parse_duration_secs("7x").is_err());
        assert!(parse_duration_secs("d").is_err());
        assert!(parse_duration_secs("").is_err());
    }

    #[test]
    fn combined_filters_join_with_and() {
        let options = RecallOptions {
            collection: Some("notes".to_string()),
            min_importance: Some(0.5),
            filters: Some(filters_from(json!({"text_like": "deploy"}))),
            ..Default::default()
        };
        let predicate = build_predicate(&options, 0).unwrap();
        assert_eq!(
            predicate.clause,
            "m.collection = ? AND m.importance >= ? AND m.text LIKE ?"
        );
    }
}
