//! Ad-hoc statement execution against a tenant database
//!
//! The executor never parses or rewrites SQL. [`QueryRunner::run`] accepts
//! any statement the connection will accept; [`QueryRunner::run_with`] holds
//! the text to a caller's [`super::ExecutionPolicy`]. Admin call sites run
//! unrestricted.
//!
//! Result sets are untyped: column names, order and types are only known once
//! the statement has run, so rows are carried as ordered `(name, CellValue)`
//! pairs.

use super::ExecutionPolicy;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use sqlx::postgres::{PgRow, PgValueFormat};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;

/// Timestamp rendering used in JSON output
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// One scalar read from a result set
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Decimal(BigDecimal),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell, if it is a number
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            CellValue::Integer(v) => Some(BigDecimal::from(*v)),
            CellValue::Decimal(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_none(),
            CellValue::Integer(v) => serializer.serialize_i64(*v),
            // Written as the exact decimal text, never through f64
            CellValue::Decimal(v) => {
                let rendered = v.to_string();
                match serde_json::Number::from_str(&rendered) {
                    Ok(number) => number.serialize(serializer),
                    Err(_) => serializer.serialize_str(&rendered),
                }
            }
            CellValue::Text(v) => serializer.serialize_str(v),
            CellValue::Boolean(v) => serializer.serialize_bool(*v),
            CellValue::Timestamp(v) => {
                serializer.serialize_str(&v.format(TIMESTAMP_FORMAT).to_string())
            }
        }
    }
}

/// One result row; column order is the order the driver reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    cells: Vec<(String, CellValue)>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: CellValue) {
        self.cells.push((column.into(), value));
    }

    /// First cell with the given column name
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Cell by position
    pub fn value_at(&self, index: usize) -> Option<&CellValue> {
        self.cells.get(index).map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FromIterator<(String, CellValue)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

impl Serialize for QueryRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Bound parameter value; identifiers are never parameters
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Integer(i64),
    Text(String),
    Timestamp(NaiveDateTime),
}

/// Anything that can run a statement for a tenant and hand back rows
#[async_trait]
pub trait QueryRunner: Send {
    /// Run `sql` with positional `params` (`$1`, `$2`, ...)
    async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<QueryRow>>;

    /// Run a statement without parameters
    async fn execute(&mut self, sql: &str) -> Result<Vec<QueryRow>> {
        self.run(sql, &[]).await
    }

    /// Run under a caller's policy. Runners that can enforce read-only
    /// execution on the server side override this.
    async fn run_with(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        policy: ExecutionPolicy,
    ) -> Result<Vec<QueryRow>> {
        policy.check(sql)?;
        self.run(sql, params).await
    }
}

/// Driver message for an execution failure, without connection details
pub(crate) fn driver_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// How a column's declared type is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Numeric,
    Float4,
    Float8,
    Timestamp,
    TimestampTz,
    Date,
    Uuid,
    Json,
    Text,
}

impl ColumnKind {
    pub(crate) fn from_type_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "BOOL" => ColumnKind::Boolean,
            "INT2" => ColumnKind::SmallInt,
            "INT4" => ColumnKind::Int,
            "INT8" => ColumnKind::BigInt,
            "NUMERIC" => ColumnKind::Numeric,
            "FLOAT4" => ColumnKind::Float4,
            "FLOAT8" => ColumnKind::Float8,
            "TIMESTAMP" => ColumnKind::Timestamp,
            "TIMESTAMPTZ" => ColumnKind::TimestampTz,
            "DATE" => ColumnKind::Date,
            "UUID" => ColumnKind::Uuid,
            "JSON" | "JSONB" => ColumnKind::Json,
            _ => ColumnKind::Text,
        }
    }
}

/// Fixed-point view of a float; non-finite values fall back to text
pub(crate) fn float_cell(value: f64) -> CellValue {
    if !value.is_finite() {
        return CellValue::Text(value.to_string());
    }
    BigDecimal::from_str(&value.to_string())
        .map(CellValue::Decimal)
        .unwrap_or_else(|_| CellValue::Text(value.to_string()))
}

fn decode_cell(row: &PgRow, index: usize, column: &str, type_name: &str) -> Result<CellValue> {
    let decode_err = |e: sqlx::Error| AppError::Execution {
        message: format!("could not read column '{}' ({}): {}", column, type_name, e),
    };

    let raw = row.try_get_raw(index).map_err(decode_err)?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }
    let text_format = matches!(raw.format(), PgValueFormat::Text);

    let value = match ColumnKind::from_type_name(type_name) {
        ColumnKind::Boolean => CellValue::Boolean(row.try_get::<bool, _>(index).map_err(decode_err)?),
        ColumnKind::SmallInt => {
            CellValue::Integer(row.try_get::<i16, _>(index).map_err(decode_err)? as i64)
        }
        ColumnKind::Int => CellValue::Integer(row.try_get::<i32, _>(index).map_err(decode_err)? as i64),
        ColumnKind::BigInt => CellValue::Integer(row.try_get::<i64, _>(index).map_err(decode_err)?),
        ColumnKind::Numeric => {
            CellValue::Decimal(row.try_get::<BigDecimal, _>(index).map_err(decode_err)?)
        }
        ColumnKind::Float4 => float_cell(row.try_get::<f32, _>(index).map_err(decode_err)? as f64),
        ColumnKind::Float8 => float_cell(row.try_get::<f64, _>(index).map_err(decode_err)?),
        ColumnKind::Timestamp => {
            CellValue::Timestamp(row.try_get::<NaiveDateTime, _>(index).map_err(decode_err)?)
        }
        ColumnKind::TimestampTz => CellValue::Timestamp(
            row.try_get::<DateTime<Utc>, _>(index)
                .map_err(decode_err)?
                .naive_utc(),
        ),
        ColumnKind::Date => CellValue::Timestamp(
            row.try_get::<NaiveDate, _>(index)
                .map_err(decode_err)?
                .and_time(NaiveTime::MIN),
        ),
        ColumnKind::Uuid => {
            CellValue::Text(row.try_get::<uuid::Uuid, _>(index).map_err(decode_err)?.to_string())
        }
        ColumnKind::Json => CellValue::Text(
            row.try_get::<serde_json::Value, _>(index)
                .map_err(decode_err)?
                .to_string(),
        ),
        // Simple-protocol results arrive as text, so any type renders verbatim
        ColumnKind::Text if text_format => {
            CellValue::Text(row.try_get_unchecked::<String, _>(index).map_err(decode_err)?)
        }
        ColumnKind::Text => CellValue::Text(row.try_get::<String, _>(index).map_err(decode_err)?),
    };

    Ok(value)
}

/// Materialize a driver row, preserving column order and NULLs
pub(crate) fn decode_row(row: &PgRow) -> Result<QueryRow> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let value = decode_cell(row, index, column.name(), column.type_info().name())?;
            Ok((column.name().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_serializes_as_json_null() {
        let row: QueryRow = vec![
            ("customer".to_string(), CellValue::Text("Acme".into())),
            ("outstanding".to_string(), CellValue::Null),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_value(&row).unwrap();
        assert!(json["outstanding"].is_null());
        assert_ne!(json["outstanding"], serde_json::json!(""));
        assert_ne!(json["outstanding"], serde_json::json!(0));
    }

    #[test]
    fn test_row_serialization_preserves_column_order() {
        let mut row = QueryRow::new();
        row.push("zeta", CellValue::Integer(1));
        row.push("alpha", CellValue::Integer(2));
        row.push("mid", CellValue::Boolean(true));

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":2,"mid":true}"#);
    }

    #[test]
    fn test_scalar_serialization() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        let decimal = BigDecimal::from_str("1234.50").unwrap();

        assert_eq!(serde_json::to_string(&CellValue::Decimal(decimal)).unwrap(), "1234.50");
        assert_eq!(
            serde_json::to_string(&CellValue::Timestamp(ts)).unwrap(),
            "\"2024-03-31T23:59:59\""
        );
        assert_eq!(serde_json::to_string(&CellValue::Text("x".into())).unwrap(), "\"x\"");
    }

    #[test]
    fn test_large_decimal_keeps_every_digit() {
        let above_f64_precision = BigDecimal::from_str("12345678901234567.89").unwrap();
        let cell = CellValue::Decimal(above_f64_precision);

        assert_eq!(serde_json::to_string(&cell).unwrap(), "12345678901234567.89");

        let mut row = QueryRow::new();
        row.push("outstanding", cell);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"outstanding":12345678901234567.89}"#
        );
    }

    #[test]
    fn test_row_lookup_by_name_and_position() {
        let mut row = QueryRow::new();
        row.push("id", CellValue::Integer(7));
        row.push("name", CellValue::Text("Globex".into()));

        assert_eq!(row.get("name"), Some(&CellValue::Text("Globex".into())));
        assert_eq!(row.value_at(0), Some(&CellValue::Integer(7)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    #[test]
    fn test_column_kind_mapping() {
        assert_eq!(ColumnKind::from_type_name("INT4"), ColumnKind::Int);
        assert_eq!(ColumnKind::from_type_name("numeric"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_type_name("TIMESTAMPTZ"), ColumnKind::TimestampTz);
        assert_eq!(ColumnKind::from_type_name("JSONB"), ColumnKind::Json);
        assert_eq!(ColumnKind::from_type_name("VARCHAR"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_type_name("INTERVAL"), ColumnKind::Text);
    }

    #[test]
    fn test_float_cells_become_fixed_point() {
        assert_eq!(
            float_cell(12.25),
            CellValue::Decimal(BigDecimal::from_str("12.25").unwrap())
        );
        assert!(matches!(float_cell(f64::NAN), CellValue::Text(_)));
    }

    #[test]
    fn test_as_decimal() {
        assert_eq!(CellValue::Integer(5).as_decimal(), Some(BigDecimal::from(5)));
        assert_eq!(CellValue::Text("5".into()).as_decimal(), None);
        assert_eq!(CellValue::Null.as_decimal(), None);
    }
}
