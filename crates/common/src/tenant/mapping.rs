//! Canonical field to physical column mappings

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::guard;

/// Where a canonical field physically lives in a tenant's schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLocation {
    pub table: String,
    pub column: String,
}

impl FieldLocation {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Both halves present
    pub fn is_resolved(&self) -> bool {
        !self.table.trim().is_empty() && !self.column.trim().is_empty()
    }
}

/// A tenant's full set of mappings, keyed by canonical field name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMapping {
    fields: BTreeMap<String, FieldLocation>,
}

impl SchemaMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a field; the last write for a key wins
    pub fn insert(&mut self, field: impl Into<String>, location: FieldLocation) {
        self.fields.insert(field.into(), location);
    }

    /// Location for `field`, only if it has both a table and a column
    pub fn resolve(&self, field: &str) -> Option<&FieldLocation> {
        self.fields.get(field).filter(|location| location.is_resolved())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldLocation)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check every entry before it is allowed into the store
    pub fn validate(&self) -> Result<()> {
        for (field, location) in &self.fields {
            if field.trim().is_empty() {
                return Err(AppError::validation("field", "Canonical field name is empty"));
            }
            if !location.is_resolved() {
                return Err(AppError::validation(
                    "field",
                    format!("Mapping for '{}' needs both a table and a column", field),
                ));
            }
            guard::validate_table_name(location.table.trim())?;
            guard::validate_identifier(location.column.trim())?;
        }
        Ok(())
    }
}

impl FromIterator<(String, FieldLocation)> for SchemaMapping {
    fn from_iter<I: IntoIterator<Item = (String, FieldLocation)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut mapping = SchemaMapping::new();
        mapping.insert("CustomerID", FieldLocation::new("Customers", "Id"));
        mapping.insert("CustomerID", FieldLocation::new("Clients", "ClientId"));

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.resolve("CustomerID").unwrap().table, "Clients");
    }

    #[test]
    fn test_resolve_skips_half_empty_entries() {
        let mut mapping = SchemaMapping::new();
        mapping.insert("TotalSales", FieldLocation::new("Sales", ""));
        assert!(mapping.resolve("TotalSales").is_none());
        assert!(mapping.resolve("Unknown").is_none());
    }

    #[test]
    fn test_validate_rejects_unsafe_identifiers() {
        let mut mapping = SchemaMapping::new();
        mapping.insert("TotalSales", FieldLocation::new("Sales", "Amount); DROP TABLE x;--"));
        assert!(matches!(mapping.validate(), Err(AppError::Validation { .. })));
    }

    #[test]
    fn test_validate_accepts_schema_qualified_tables() {
        let mapping: SchemaMapping = vec![
            ("CustomerID".to_string(), FieldLocation::new("dbo.Customers", "CustomerID")),
            ("TotalSales".to_string(), FieldLocation::new("Sales", "Amount")),
        ]
        .into_iter()
        .collect();
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn test_serializes_as_object() {
        let mut mapping = SchemaMapping::new();
        mapping.insert("CustomerID", FieldLocation::new("Customers", "CustomerID"));
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["CustomerID"]["table"], "Customers");
    }
}
