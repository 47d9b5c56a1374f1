//! Binding query values and decoding result rows.
//!
//! Rows come back as JSON objects keyed by column name, in the same shape
//! the in-memory store produces: timestamps as RFC 3339 strings with
//! microseconds, intervals as seconds, JSONB as-is. Search vectors are
//! write-only and left out of decoded rows.

use chrono::{DateTime, Utc};
use dynamic_table::{ColumnType, Row, TableError, Value};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, Row as _, TypeInfo};

fn storage_error(e: impl std::fmt::Display) -> TableError {
    TableError::StorageError(e.to_string())
}

/// Bind every parameter of a statement, in order.
pub fn arguments(params: &[Value]) -> Result<PgArguments, TableError> {
    let mut args = PgArguments::default();
    for value in params {
        bind_value(&mut args, value)?;
    }
    Ok(args)
}

fn bind_value(args: &mut PgArguments, value: &Value) -> Result<(), TableError> {
    match value {
        Value::String(s) | Value::SearchVector(s) => args.add(s.as_str()),
        Value::Int(n) => args.add(*n),
        Value::UInt(n) => args.add(i64::try_from(*n).map_err(storage_error)?),
        Value::Float(n) | Value::Interval(n) => args.add(*n),
        Value::Bool(b) => args.add(*b),
        Value::Strings(v) => args.add(v.clone()),
        Value::Ints(v) => args.add(v.clone()),
        Value::Datetime(dt) => args.add(*dt.inner()),
        Value::Json(v) => args.add(v.clone()),
        Value::Null(column_type) => match column_type {
            ColumnType::Serial | ColumnType::BigInt => args.add(None::<i64>),
            ColumnType::Double | ColumnType::Interval => args.add(None::<f64>),
            ColumnType::Boolean => args.add(None::<bool>),
            ColumnType::Timestamp => args.add(None::<DateTime<Utc>>),
            ColumnType::Json => args.add(None::<JsonValue>),
            ColumnType::Text | ColumnType::TsVector => args.add(None::<String>),
        },
    }
    .map_err(storage_error)
}

fn interval_seconds(interval: &PgInterval) -> f64 {
    // Months are taken as 30 days, as PostgreSQL's own EXTRACT(EPOCH) does.
    let days = f64::from(interval.months) * 30.0 + f64::from(interval.days);
    days * 86_400.0 + interval.microseconds as f64 / 1_000_000.0
}

fn number(n: f64) -> JsonValue {
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Decode a result row into the shared row representation.
pub fn decode_row(row: &PgRow) -> Result<Row, TableError> {
    let mut decoded = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "TSVECTOR" => continue,
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map_err(storage_error)?
                .map(|n| number(f64::from(n))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .map_err(storage_error)?
                .map(number),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(index)
                .map_err(storage_error)?
                .map(|dt| JsonValue::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))),
            "INTERVAL" => row
                .try_get::<Option<PgInterval>, _>(index)
                .map_err(storage_error)?
                .map(|interval| number(interval_seconds(&interval))),
            "JSON" | "JSONB" => row
                .try_get::<Option<JsonValue>, _>(index)
                .map_err(storage_error)?,
            "INT8[]" => row
                .try_get::<Option<Vec<i64>>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::from),
            "TEXT[]" => row
                .try_get::<Option<Vec<String>>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::from),
            _ => row
                .try_get::<Option<String>, _>(index)
                .map_err(storage_error)?
                .map(JsonValue::String),
        };
        decoded.insert(column.name().to_string(), value.unwrap_or(JsonValue::Null));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_decode_to_seconds() {
        let interval = PgInterval {
            months: 0,
            days: 1,
            microseconds: 90_500_000,
        };
        assert_eq!(interval_seconds(&interval), 86_490.5);
    }

    #[test]
    fn every_value_kind_binds() {
        let params = vec![
            Value::from("text"),
            Value::Int(1),
            Value::UInt(2),
            Value::Float(1.5),
            Value::Bool(true),
            Value::Ints(vec![1, 2]),
            Value::Strings(vec!["a".to_string()]),
            Value::Datetime(dynamic_table::StorageDatetime::now()),
            Value::Interval(60.0),
            Value::Json(serde_json::json!({"a": 1})),
            Value::SearchVector("hello".to_string()),
            Value::Null(ColumnType::Timestamp),
        ];
        assert!(arguments(&params).is_ok());
        assert!(arguments(&[Value::UInt(u64::MAX)]).is_err());
    }
}
