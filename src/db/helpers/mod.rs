use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Number, Value};

use crate::db::models::{SampleResult, SampleStatus};

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

/// Timestamps coming from devices: RFC 3339, or a naive date-time read as UTC.
pub fn parse_device_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(anyhow!("unrecognised timestamp '{value}'"))
}

pub fn parse_status(value: &str) -> Result<SampleStatus> {
    match value {
        "open" => Ok(SampleStatus::Open),
        "closed" => Ok(SampleStatus::Closed),
        other => Err(anyhow!("unknown sample status {other}")),
    }
}

pub fn parse_result(value: &str) -> Result<SampleResult> {
    match value {
        "hydrated" => Ok(SampleResult::Hydrated),
        "mild_dehydration" => Ok(SampleResult::MildDehydration),
        "dehydrated" => Ok(SampleResult::Dehydrated),
        "inconclusive" => Ok(SampleResult::Inconclusive),
        other => Err(anyhow!("unknown sample result {other}")),
    }
}

/// Table and column names are spliced into SQL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid SQL identifier '{name}'");
    }
    Ok(name)
}

/// Nested arrays and objects are stored as their JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

pub fn row_to_map(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<Map<String, Value>> {
    let mut record = Map::with_capacity(columns.len());
    for (index, name) in columns.iter().enumerate() {
        record.insert(name.clone(), sql_to_json(row.get_ref(index)?));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn device_timestamps_accept_common_shapes() {
        let rfc = parse_device_timestamp("2025-03-01T10:15:30-03:00").unwrap();
        assert_eq!(rfc.hour(), 13);

        let spaced = parse_device_timestamp("2025-03-01 10:15:30").unwrap();
        assert_eq!(spaced.minute(), 15);

        let iso = parse_device_timestamp("2025-03-01T10:15:30.250").unwrap();
        assert_eq!(iso.day(), 1);

        assert!(parse_device_timestamp("yesterday").is_err());
    }

    #[test]
    fn identifiers_reject_sql_fragments() {
        assert!(validate_identifier("spectrum_datapoints").is_ok());
        assert!(validate_identifier("_private1").is_ok());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("logs; DROP TABLE samples").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn json_values_map_to_sqlite_affinities() {
        assert_eq!(json_to_sql(&Value::from(3)), SqlValue::Integer(3));
        assert_eq!(json_to_sql(&Value::from(2.5)), SqlValue::Real(2.5));
        assert_eq!(json_to_sql(&Value::Bool(true)), SqlValue::Integer(1));
        assert_eq!(
            json_to_sql(&serde_json::json!([1, 2])),
            SqlValue::Text("[1,2]".into())
        );
    }
}
