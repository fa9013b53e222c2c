use chrono::{DateTime, NaiveDate, Utc};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{Connection, Params, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value as JsonValue};

use crate::error::Result;

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

pub fn to_json_text<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

pub fn opt_from_json_text<T: DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    text.as_deref().map(from_json_text).transpose()
}

/// Like `query_row`, but an empty result is `None` instead of an error.
pub fn query_opt<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> duckdb::Result<Option<T>>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> duckdb::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => f(row).map(Some),
        None => Ok(None),
    }
}

/// Converts a JSON parameter into a DuckDB bind value. Arrays and objects
/// are bound as their JSON text.
pub fn json_to_duck(value: &JsonValue) -> DuckValue {
    match value {
        JsonValue::Null => DuckValue::Null,
        JsonValue::Bool(b) => DuckValue::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                DuckValue::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                DuckValue::UBigInt(u)
            } else {
                DuckValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

/// Converts a DuckDB cell into JSON for result sets.
pub fn duck_to_json(value: DuckValue) -> JsonValue {
    match value {
        DuckValue::Null => JsonValue::Null,
        DuckValue::Boolean(b) => JsonValue::Bool(b),
        DuckValue::TinyInt(i) => JsonValue::from(i),
        DuckValue::SmallInt(i) => JsonValue::from(i),
        DuckValue::Int(i) => JsonValue::from(i),
        DuckValue::BigInt(i) => JsonValue::from(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => JsonValue::from(small),
            Err(_) => JsonValue::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => JsonValue::from(i),
        DuckValue::USmallInt(i) => JsonValue::from(i),
        DuckValue::UInt(i) => JsonValue::from(i),
        DuckValue::UBigInt(i) => JsonValue::from(i),
        DuckValue::Float(f) => float_to_json(f as f64),
        DuckValue::Double(f) => float_to_json(f),
        DuckValue::Decimal(d) => JsonValue::String(d.to_string()),
        DuckValue::Text(s) => JsonValue::String(s),
        DuckValue::Enum(s) => JsonValue::String(s),
        DuckValue::Date32(days) => {
            // days since 1970-01-01
            NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                .map(|d| JsonValue::String(d.to_string()))
                .unwrap_or(JsonValue::from(days))
        }
        DuckValue::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|ts| JsonValue::String(ts.to_rfc3339()))
                .unwrap_or(JsonValue::from(raw))
        }
        DuckValue::List(items) => JsonValue::Array(items.into_iter().map(duck_to_json).collect()),
        other => JsonValue::String(format!("{:?}", other)),
    }
}

fn float_to_json(f: f64) -> JsonValue {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Short label for the kind of value a column holds, taken from the first
/// non-null cell.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(n) if n.is_f64() => "double",
        JsonValue::Number(_) => "integer",
        JsonValue::String(_) => "text",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "struct",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn millis_conversion_is_lossless_at_millisecond_precision() {
        let ts = from_millis(1_717_171_717_123);
        assert_eq!(to_millis(ts), 1_717_171_717_123);
    }

    #[test]
    fn bind_values_keep_native_types() {
        assert_eq!(json_to_duck(&json!(7)), DuckValue::BigInt(7));
        assert_eq!(json_to_duck(&json!(true)), DuckValue::Boolean(true));
        assert_eq!(json_to_duck(&json!("x")), DuckValue::Text("x".into()));
        assert_eq!(json_to_duck(&json!(null)), DuckValue::Null);
        assert_eq!(json_to_duck(&json!([1, 2])), DuckValue::Text("[1,2]".into()));
    }

    #[test]
    fn dates_render_as_iso_strings() {
        assert_eq!(duck_to_json(DuckValue::Date32(0)), json!("1970-01-01"));
        assert_eq!(duck_to_json(DuckValue::Date32(19_723)), json!("2024-01-01"));
    }
}
