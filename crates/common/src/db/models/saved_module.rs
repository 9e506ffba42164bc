//! Saved module entity

use crate::errors::AppError;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Chart hint stored with a module
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationType {
    Table,
    Bar,
    Pie,
    Line,
    Area,
    Kpi,
    Heatmap,
    Map,
}

impl VisualizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisualizationType::Table => "table",
            VisualizationType::Bar => "bar",
            VisualizationType::Pie => "pie",
            VisualizationType::Line => "line",
            VisualizationType::Area => "area",
            VisualizationType::Kpi => "kpi",
            VisualizationType::Heatmap => "heatmap",
            VisualizationType::Map => "map",
        }
    }
}

impl FromStr for VisualizationType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(VisualizationType::Table),
            "bar" => Ok(VisualizationType::Bar),
            "pie" => Ok(VisualizationType::Pie),
            "line" => Ok(VisualizationType::Line),
            "area" => Ok(VisualizationType::Area),
            "kpi" => Ok(VisualizationType::Kpi),
            "heatmap" => Ok(VisualizationType::Heatmap),
            "map" => Ok(VisualizationType::Map),
            other => Err(AppError::validation(
                "visualizationType",
                format!("Unknown visualization type '{}'", other),
            )),
        }
    }
}

// Stored rows are trusted; anything unrecognised renders as a table
impl From<String> for VisualizationType {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(VisualizationType::Table)
    }
}

impl From<VisualizationType> for String {
    fn from(v: VisualizationType) -> Self {
        v.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "saved_modules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    #[sea_orm(column_type = "Text")]
    pub sql_text: String,

    #[sea_orm(column_type = "Text")]
    pub visualization_type: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    #[sea_orm(column_type = "Text", nullable)]
    pub origin_ip: Option<String>,

    pub is_hidden: bool,
}

impl Model {
    pub fn visualization(&self) -> VisualizationType {
        VisualizationType::from(self.visualization_type.clone())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visualization_parse_is_case_insensitive() {
        assert_eq!("KPI".parse::<VisualizationType>().unwrap(), VisualizationType::Kpi);
        assert_eq!(" heatmap ".parse::<VisualizationType>().unwrap(), VisualizationType::Heatmap);
        assert!("radar".parse::<VisualizationType>().is_err());
    }

    #[test]
    fn test_unknown_stored_value_falls_back_to_table() {
        assert_eq!(VisualizationType::from("gauge".to_string()), VisualizationType::Table);
        assert_eq!(String::from(VisualizationType::Area), "area");
    }
}
