//! Tenant connection profile entity

use crate::tenant::{AccountStatus, ConnectionProfile, TenantId};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenant_profiles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub tenant_id: String,

    #[sea_orm(column_type = "Text")]
    pub server: String,

    #[sea_orm(column_type = "Text")]
    pub database_name: String,

    #[sea_orm(column_type = "Text")]
    pub username: String,

    #[sea_orm(column_type = "Text")]
    #[serde(skip_serializing)]
    pub password: String,

    pub refresh_interval_ms: i64,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ConnectionProfile {
    fn from(model: Model) -> Self {
        ConnectionProfile {
            tenant_id: TenantId::from(model.tenant_id),
            server: model.server,
            database: model.database_name,
            username: model.username,
            password: model.password,
            refresh_interval_ms: model.refresh_interval_ms,
            status: AccountStatus::from(model.status),
        }
    }
}
