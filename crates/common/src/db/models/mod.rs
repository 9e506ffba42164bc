//! SeaORM entity models
//!
//! Control-plane tables: tenant profiles, schema mappings and saved modules.

mod saved_module;
mod schema_mapping;
mod tenant_profile;

pub use tenant_profile::{
    Entity as TenantProfileEntity,
    Model as TenantProfile,
    ActiveModel as TenantProfileActiveModel,
    Column as TenantProfileColumn,
};

pub use schema_mapping::{
    Entity as SchemaMappingEntity,
    Model as SchemaMappingRow,
    ActiveModel as SchemaMappingActiveModel,
    Column as SchemaMappingColumn,
};

pub use saved_module::{
    Entity as SavedModuleEntity,
    Model as SavedModule,
    ActiveModel as SavedModuleActiveModel,
    Column as SavedModuleColumn,
    VisualizationType,
};
