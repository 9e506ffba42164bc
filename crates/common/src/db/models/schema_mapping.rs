//! Schema mapping entity, one row per canonical field per tenant

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "schema_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub field_name: String,

    #[sea_orm(column_type = "Text")]
    pub table_name: String,

    #[sea_orm(column_type = "Text")]
    pub column_name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
