//! Aggregate query synthesis
//!
//! Builds a grouped, ranked statement from a tenant's schema mapping instead
//! of a hand-written query:
//!
//! ```text
//! SELECT t1."CustomerID" AS entity_id, t2."Name" AS entity_name,
//!        SUM(CAST(t3."Amount" AS NUMERIC)) AS metric_value
//! FROM "Customers" t1
//! INNER JOIN "CustomerNames" t2 ON t1."CustomerID" = t2."CustomerID"
//! INNER JOIN "Sales" t3 ON t1."CustomerID" = t3."CustomerID"
//! WHERE t3."InvoiceDate" BETWEEN $1 AND $2
//! GROUP BY t1."CustomerID", t2."Name"
//! ORDER BY metric_value DESC NULLS LAST
//! LIMIT 5
//! ```
//!
//! Every joined table must carry the id field's column under the same name.
//! Mapping names are allow-listed and quoted; date bounds are parameters.

use crate::errors::{AppError, Result};
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::executor::{CellValue, QueryRow, QueryRunner, SqlParam};
use super::guard::{quote_identifier, quote_table_name};
use super::mapping::SchemaMapping;

pub const DEFAULT_TOP_N: u32 = 5;
pub const MAX_TOP_N: u32 = 1000;

/// Aggregate applied to the value column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Count => "count",
        }
    }

    /// SQL expression over an already-qualified column.
    ///
    /// Numeric aggregates cast to NUMERIC first so integer columns are not
    /// truncated; COUNT only needs the column itself.
    fn expression(&self, column: &str) -> String {
        match self {
            AggregateFunction::Count => format!("COUNT({})", column),
            other => format!(
                "{}(CAST({} AS NUMERIC))",
                other.as_str().to_ascii_uppercase(),
                column
            ),
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "avg" | "average" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "count" => Ok(AggregateFunction::Count),
            other => Err(AppError::validation(
                "aggregateFunction",
                format!("Unknown aggregate function '{}'", other),
            )),
        }
    }
}

impl TryFrom<String> for AggregateFunction {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AggregateFunction> for String {
    fn from(f: AggregateFunction) -> Self {
        f.as_str().to_string()
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_function() -> AggregateFunction {
    AggregateFunction::Sum
}

/// Accept `2024-03-31` as well as full timestamps, keeping only the day
fn deserialize_day<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| {
        let s = s.trim();
        s.get(..10)
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{}'", s)))
    })
    .transpose()
}

/// A ranked aggregate over mapped fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub id_key: String,
    pub name_key: String,
    pub value_key: String,

    #[serde(default = "default_function")]
    pub aggregate_function: AggregateFunction,

    #[serde(default)]
    pub top_n: Option<u32>,

    #[serde(default)]
    pub date_key: Option<String>,

    #[serde(default, deserialize_with = "deserialize_day")]
    pub from: Option<NaiveDate>,

    #[serde(default, deserialize_with = "deserialize_day")]
    pub to: Option<NaiveDate>,
}

impl AggregateRequest {
    pub fn top_n(&self) -> u32 {
        self.top_n.unwrap_or(DEFAULT_TOP_N)
    }

    pub fn validate(&self) -> Result<()> {
        let top_n = self.top_n();
        if top_n == 0 || top_n > MAX_TOP_N {
            return Err(AppError::validation(
                "topN",
                format!("topN must be between 1 and {}", MAX_TOP_N),
            ));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::validation("from", "from must not be after to"));
            }
        }
        Ok(())
    }
}

/// Inclusive whole-day range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DayWindow {
    /// Midnight of `from` through one microsecond short of the midnight after `to`
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        let end = to
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap_or_else(|| to.and_time(NaiveTime::MIN));
        Self {
            start: from.and_time(NaiveTime::MIN),
            end,
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Statement text plus its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// One ranked entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateEntry {
    pub entity_id: CellValue,
    pub entity_name: CellValue,
    #[serde(serialize_with = "serialize_metric")]
    pub metric_value: Option<BigDecimal>,
}

fn serialize_metric<S: Serializer>(
    value: &Option<BigDecimal>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) => CellValue::Decimal(v.clone()).serialize(serializer),
        None => serializer.serialize_none(),
    }
}

impl AggregateEntry {
    fn from_row(row: &QueryRow) -> Self {
        Self {
            entity_id: row.value_at(0).cloned().unwrap_or(CellValue::Null),
            entity_name: row.value_at(1).cloned().unwrap_or(CellValue::Null),
            metric_value: row.value_at(2).and_then(CellValue::as_decimal),
        }
    }
}

/// Aliases handed out per distinct source table, in first-seen order
#[derive(Default)]
struct TableAliases {
    tables: Vec<(String, String)>,
}

impl TableAliases {
    fn assign(&mut self, table: &str) -> String {
        if let Some(alias) = self.lookup(table) {
            return alias;
        }
        let alias = format!("t{}", self.tables.len() + 1);
        self.tables.push((table.to_string(), alias.clone()));
        alias
    }

    fn lookup(&self, table: &str) -> Option<String> {
        self.tables
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(table))
            .map(|(_, alias)| alias.clone())
    }
}

/// Turns mapped metric requests into SQL and ranked entries
pub struct AggregateSynthesizer;

impl AggregateSynthesizer {
    /// Build the statement, or `None` when a required key does not resolve
    pub fn build(mapping: &SchemaMapping, request: &AggregateRequest) -> Result<Option<SynthesizedQuery>> {
        request.validate()?;

        let (Some(id), Some(name), Some(value)) = (
            mapping.resolve(&request.id_key),
            mapping.resolve(&request.name_key),
            mapping.resolve(&request.value_key),
        ) else {
            return Ok(None);
        };

        let mut aliases = TableAliases::default();
        let id_alias = aliases.assign(id.table.trim());
        let name_alias = aliases.assign(name.table.trim());
        let value_alias = aliases.assign(value.table.trim());

        let id_col = quote_identifier(id.column.trim())?;
        let id_expr = format!("{}.{}", id_alias, id_col);
        let name_expr = format!("{}.{}", name_alias, quote_identifier(name.column.trim())?);
        let value_expr = format!("{}.{}", value_alias, quote_identifier(value.column.trim())?);

        let mut sql = format!(
            "SELECT {} AS entity_id, {} AS entity_name, {} AS metric_value",
            id_expr,
            name_expr,
            request.aggregate_function.expression(&value_expr)
        );

        for (index, (table, alias)) in aliases.tables.iter().enumerate() {
            let table = quote_table_name(table)?;
            if index == 0 {
                sql.push_str(&format!("\nFROM {} {}", table, alias));
            } else {
                sql.push_str(&format!(
                    "\nINNER JOIN {} {} ON {} = {}.{}",
                    table, alias, id_expr, alias, id_col
                ));
            }
        }

        let mut params = Vec::new();
        let date = request
            .date_key
            .as_deref()
            .and_then(|key| mapping.resolve(key));
        if let (Some(date), Some(from), Some(to)) = (date, request.from, request.to) {
            // A date column outside the joined tables is read from the value table
            let alias = aliases.lookup(date.table.trim()).unwrap_or_else(|| value_alias.clone());
            let window = DayWindow::new(from, to);
            sql.push_str(&format!(
                "\nWHERE {}.{} BETWEEN $1 AND $2",
                alias,
                quote_identifier(date.column.trim())?
            ));
            params.push(SqlParam::Timestamp(window.start));
            params.push(SqlParam::Timestamp(window.end));
        }

        sql.push_str(&format!(
            "\nGROUP BY {}, {}\nORDER BY metric_value DESC NULLS LAST\nLIMIT {}",
            id_expr,
            name_expr,
            request.top_n()
        ));

        Ok(Some(SynthesizedQuery { sql, params }))
    }

    /// Build, run and rank. Unresolved keys give an empty result, not an error.
    pub async fn run<R>(
        runner: &mut R,
        mapping: &SchemaMapping,
        request: &AggregateRequest,
    ) -> Result<Vec<AggregateEntry>>
    where
        R: QueryRunner + ?Sized,
    {
        let Some(query) = Self::build(mapping, request)? else {
            debug!(
                id_key = %request.id_key,
                name_key = %request.name_key,
                value_key = %request.value_key,
                "Aggregate keys not mapped, returning empty result"
            );
            return Ok(Vec::new());
        };

        Self::fetch(runner, &query, request.top_n()).await
    }

    /// Run an already built statement and rank what comes back
    pub async fn fetch<R>(runner: &mut R, query: &SynthesizedQuery, top_n: u32) -> Result<Vec<AggregateEntry>>
    where
        R: QueryRunner + ?Sized,
    {
        let rows = runner.run(&query.sql, &query.params).await?;

        let mut entries: Vec<AggregateEntry> = rows.iter().map(AggregateEntry::from_row).collect();
        // Stable: equal values keep the order the database gave them
        entries.sort_by(|a, b| b.metric_value.cmp(&a.metric_value));
        entries.truncate(top_n as usize);

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::mapping::FieldLocation;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeRunner {
        rows: Vec<QueryRow>,
        calls: Vec<(String, Vec<SqlParam>)>,
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<QueryRow>> {
            self.calls.push((sql.to_string(), params.to_vec()));
            Ok(self.rows.clone())
        }
    }

    fn mapping() -> SchemaMapping {
        let mut m = SchemaMapping::new();
        m.insert("CustomerID", FieldLocation::new("Customers", "CustomerID"));
        m.insert("CustomerName", FieldLocation::new("CustomerNames", "Name"));
        m.insert("TotalSales", FieldLocation::new("Sales", "Amount"));
        m.insert("InvoiceDate", FieldLocation::new("Sales", "InvoiceDate"));
        m.insert("LedgerDate", FieldLocation::new("Ledger", "PostedOn"));
        m
    }

    fn request() -> AggregateRequest {
        AggregateRequest {
            id_key: "CustomerID".into(),
            name_key: "CustomerName".into(),
            value_key: "TotalSales".into(),
            aggregate_function: AggregateFunction::Sum,
            top_n: None,
            date_key: None,
            from: None,
            to: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ranked_row(id: &str, value: i64) -> QueryRow {
        let mut row = QueryRow::new();
        row.push("entity_id", CellValue::Text(id.into()));
        row.push("entity_name", CellValue::Text(format!("Customer {id}")));
        row.push("metric_value", CellValue::Decimal(BigDecimal::from(value)));
        row
    }

    #[tokio::test]
    async fn test_unmapped_required_key_returns_empty_without_running() {
        for missing in ["CustomerID", "CustomerName", "TotalSales"] {
            let mut req = request();
            match missing {
                "CustomerID" => req.id_key = "Nope".into(),
                "CustomerName" => req.name_key = "Nope".into(),
                _ => req.value_key = "Nope".into(),
            }
            let mut runner = FakeRunner::default();
            let result = AggregateSynthesizer::run(&mut runner, &mapping(), &req).await.unwrap();
            assert!(result.is_empty());
            assert!(runner.calls.is_empty(), "{missing} unmapped must not execute");
        }
    }

    #[tokio::test]
    async fn test_half_empty_mapping_entry_returns_empty() {
        let mut m = mapping();
        m.insert("TotalSales", FieldLocation::new("Sales", " "));
        let mut runner = FakeRunner::default();
        let result = AggregateSynthesizer::run(&mut runner, &m, &request()).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_join_chain_on_id_column() {
        let query = AggregateSynthesizer::build(&mapping(), &request()).unwrap().unwrap();

        assert!(query.sql.contains("FROM \"Customers\" t1"));
        assert!(query.sql.contains(
            "INNER JOIN \"CustomerNames\" t2 ON t1.\"CustomerID\" = t2.\"CustomerID\""
        ));
        assert!(query.sql.contains("INNER JOIN \"Sales\" t3 ON t1.\"CustomerID\" = t3.\"CustomerID\""));
        assert!(query.sql.contains("SUM(CAST(t3.\"Amount\" AS NUMERIC)) AS metric_value"));
        assert!(query.sql.contains("GROUP BY t1.\"CustomerID\", t2.\"Name\""));
        assert!(query.sql.contains("ORDER BY metric_value DESC NULLS LAST"));
        assert!(query.sql.ends_with("LIMIT 5"));
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_single_table_mapping_has_no_self_join() {
        let mut m = SchemaMapping::new();
        m.insert("CustomerID", FieldLocation::new("Customers", "CustomerID"));
        m.insert("CustomerName", FieldLocation::new("Customers", "Name"));
        m.insert("TotalSales", FieldLocation::new("Customers", "Outstanding"));

        let query = AggregateSynthesizer::build(&m, &request()).unwrap().unwrap();
        assert!(!query.sql.contains("JOIN"));
        assert!(query.sql.contains("t1.\"Outstanding\""));
    }

    #[test]
    fn test_date_filter_uses_owning_alias_and_parameters() {
        let mut req = request();
        req.date_key = Some("InvoiceDate".into());
        req.from = Some(day(2024, 1, 1));
        req.to = Some(day(2024, 1, 31));

        let query = AggregateSynthesizer::build(&mapping(), &req).unwrap().unwrap();
        assert!(query.sql.contains("WHERE t3.\"InvoiceDate\" BETWEEN $1 AND $2"));
        assert!(!query.sql.contains("2024"));
        assert_eq!(
            query.params,
            vec![
                SqlParam::Timestamp(day(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap()),
                SqlParam::Timestamp(day(2024, 1, 31).and_hms_micro_opt(23, 59, 59, 999_999).unwrap()),
            ]
        );
    }

    #[test]
    fn test_date_column_outside_join_falls_back_to_value_table() {
        let mut req = request();
        req.date_key = Some("LedgerDate".into());
        req.from = Some(day(2024, 1, 1));
        req.to = Some(day(2024, 1, 1));

        let query = AggregateSynthesizer::build(&mapping(), &req).unwrap().unwrap();
        assert!(query.sql.contains("WHERE t3.\"PostedOn\" BETWEEN $1 AND $2"));
        assert!(!query.sql.contains("\"Ledger\""));
    }

    #[test]
    fn test_date_filter_needs_both_bounds() {
        let mut req = request();
        req.date_key = Some("InvoiceDate".into());
        req.from = Some(day(2024, 1, 1));

        let query = AggregateSynthesizer::build(&mapping(), &req).unwrap().unwrap();
        assert!(!query.sql.contains("WHERE"));
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_day_window_is_inclusive_on_both_ends() {
        let window = DayWindow::new(day(2024, 3, 1), day(2024, 3, 31));

        assert!(window.contains(day(2024, 3, 1).and_hms_opt(0, 0, 0).unwrap()));
        assert!(window.contains(day(2024, 3, 31).and_hms_opt(23, 59, 59).unwrap()));
        assert!(window.contains(day(2024, 3, 31).and_hms_micro_opt(23, 59, 59, 999_999).unwrap()));
        assert!(!window.contains(day(2024, 4, 1).and_hms_opt(0, 0, 0).unwrap()));
        assert!(!window.contains(day(2024, 2, 29).and_hms_micro_opt(23, 59, 59, 999_999).unwrap()));
    }

    #[tokio::test]
    async fn test_top_n_bounds_and_orders_results() {
        let mut runner = FakeRunner {
            rows: vec![
                ranked_row("A", 30),
                ranked_row("B", 50),
                ranked_row("C", 10),
                ranked_row("D", 50),
            ],
            ..FakeRunner::default()
        };
        let mut req = request();
        req.top_n = Some(3);

        let result = AggregateSynthesizer::run(&mut runner, &mapping(), &req).await.unwrap();

        assert_eq!(result.len(), 3);
        let ids: Vec<_> = result.iter().map(|e| e.entity_id.clone()).collect();
        assert!(ids.contains(&CellValue::Text("B".into())));
        assert!(ids.contains(&CellValue::Text("D".into())));
        assert!(!ids.contains(&CellValue::Text("C".into())));
        assert_eq!(result[0].metric_value, Some(BigDecimal::from(50)));
        assert_eq!(result[1].metric_value, Some(BigDecimal::from(50)));
        assert_eq!(result[2].metric_value, Some(BigDecimal::from(30)));
        assert!(runner.calls[0].0.ends_with("LIMIT 3"));
    }

    #[tokio::test]
    async fn test_null_aggregate_ranks_below_real_values() {
        let mut empty_group = QueryRow::new();
        empty_group.push("entity_id", CellValue::Text("N".into()));
        empty_group.push("entity_name", CellValue::Text("Customer N".into()));
        empty_group.push("metric_value", CellValue::Null);
        let mut runner = FakeRunner {
            rows: vec![empty_group, ranked_row("A", 5), ranked_row("B", 9)],
            ..FakeRunner::default()
        };
        let mut req = request();
        req.aggregate_function = AggregateFunction::Avg;
        req.top_n = Some(2);

        let result = AggregateSynthesizer::run(&mut runner, &mapping(), &req).await.unwrap();

        assert!(runner.calls[0].0.contains("ORDER BY metric_value DESC NULLS LAST\nLIMIT 2"));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].metric_value, Some(BigDecimal::from(9)));
        assert_eq!(result[1].metric_value, Some(BigDecimal::from(5)));
    }

    #[test]
    fn test_count_skips_numeric_cast() {
        let mut req = request();
        req.aggregate_function = AggregateFunction::Count;
        let query = AggregateSynthesizer::build(&mapping(), &req).unwrap().unwrap();
        assert!(query.sql.contains("COUNT(t3.\"Amount\") AS metric_value"));
    }

    #[test]
    fn test_unsafe_identifier_in_stored_mapping_is_rejected() {
        let mut m = mapping();
        m.insert("TotalSales", FieldLocation::new("Sales", "Amount\" --"));
        let err = AggregateSynthesizer::build(&m, &request()).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn test_request_validation() {
        let mut req = request();
        req.top_n = Some(0);
        assert!(req.validate().is_err());

        let mut req = request();
        req.from = Some(day(2024, 2, 1));
        req.to = Some(day(2024, 1, 1));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_deserialization() {
        let req: AggregateRequest = serde_json::from_value(serde_json::json!({
            "idKey": "CustomerID",
            "nameKey": "CustomerName",
            "valueKey": "TotalSales",
            "aggregateFunction": "AVG",
            "dateKey": "InvoiceDate",
            "from": "2024-01-01T08:30:00",
            "to": "2024-01-31"
        }))
        .unwrap();

        assert_eq!(req.aggregate_function, AggregateFunction::Avg);
        assert_eq!(req.top_n(), DEFAULT_TOP_N);
        assert_eq!(req.from, Some(day(2024, 1, 1)));
        assert_eq!(req.to, Some(day(2024, 1, 31)));
    }

    #[test]
    fn test_entry_serialization() {
        let entry = AggregateEntry {
            entity_id: CellValue::Integer(7),
            entity_name: CellValue::Text("Globex".into()),
            metric_value: Some(BigDecimal::from_str("1250.75").unwrap()),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["entityId"], 7);
        assert_eq!(json["entityName"], "Globex");
        assert_eq!(json["metricValue"], 1250.75);
    }
}
