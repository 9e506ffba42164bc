//! Repository pattern for control-plane storage
//!
//! Profiles, schema mappings and saved modules. Writes that must be atomic
//! per tenant (mapping replace, module transfer) run in one transaction.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::modules::transfer::{plan_transfer, ModuleCopy, TransferAction, TransferOutcome, TransferRequest};
use crate::tenant::{AccountStatus, ConnectionProfile, FieldLocation, SchemaMapping, TenantId};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
};
use tracing::{debug, info};

/// Strictly later than `previous`, and never earlier than `now`
pub(crate) fn next_updated_at(
    previous: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> DateTime<FixedOffset> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

/// Serialize module writes for one tenant until the transaction ends
async fn lock_tenant_modules(txn: &DatabaseTransaction, tenant_id: &str) -> Result<()> {
    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        [format!("saved_modules:{}", tenant_id).into()],
    );
    txn.execute(stmt).await?;
    Ok(())
}

fn copy_into(copy: &ModuleCopy, target: &str, origin_ip: Option<&str>) -> SavedModuleActiveModel {
    let now = Utc::now().fixed_offset();
    SavedModuleActiveModel {
        tenant_id: Set(target.to_string()),
        title: Set(copy.title.clone()),
        sql_text: Set(copy.sql_text.clone()),
        visualization_type: Set(copy.visualization_type.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        origin_ip: Set(origin_ip.map(str::to_string)),
        is_hidden: Set(false),
        ..Default::default()
    }
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Tenant Profile Operations
    // ========================================================================

    /// Find a tenant's connection profile
    pub async fn get_profile(&self, tenant_id: &TenantId) -> Result<Option<ConnectionProfile>> {
        let model = TenantProfileEntity::find_by_id(tenant_id.to_string())
            .one(self.read_conn())
            .await?;

        Ok(model.map(ConnectionProfile::from))
    }

    /// Insert or overwrite a tenant's connection profile
    pub async fn upsert_profile(&self, profile: &ConnectionProfile) -> Result<ConnectionProfile> {
        let now = Utc::now().fixed_offset();

        let model = TenantProfileActiveModel {
            tenant_id: Set(profile.tenant_id.to_string()),
            server: Set(profile.server.trim().to_string()),
            database_name: Set(profile.database.trim().to_string()),
            username: Set(profile.username.trim().to_string()),
            password: Set(profile.password.clone()),
            refresh_interval_ms: Set(profile.refresh_interval_ms),
            status: Set(profile.status.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let saved = TenantProfileEntity::insert(model)
            .on_conflict(
                OnConflict::column(TenantProfileColumn::TenantId)
                    .update_columns([
                        TenantProfileColumn::Server,
                        TenantProfileColumn::DatabaseName,
                        TenantProfileColumn::Username,
                        TenantProfileColumn::Password,
                        TenantProfileColumn::RefreshIntervalMs,
                        TenantProfileColumn::Status,
                        TenantProfileColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_with_returning(self.write_conn())
            .await?;

        info!(tenant_id = %profile.tenant_id, server = %saved.server, "Tenant profile saved");
        Ok(ConnectionProfile::from(saved))
    }

    /// Change a tenant's account status
    pub async fn set_status(&self, tenant_id: &TenantId, status: AccountStatus) -> Result<ConnectionProfile> {
        let existing = TenantProfileEntity::find_by_id(tenant_id.to_string())
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "tenant".to_string(),
                id: tenant_id.to_string(),
            })?;

        let mut model = existing.into_active_model();
        model.status = Set(status.as_str().to_string());
        model.updated_at = Set(Utc::now().fixed_offset());

        let updated = model.update(self.write_conn()).await?;
        info!(tenant_id = %tenant_id, status = status.as_str(), "Tenant status changed");

        Ok(ConnectionProfile::from(updated))
    }

    // ========================================================================
    // Schema Mapping Operations
    // ========================================================================

    /// Load a tenant's full mapping set
    pub async fn get_mapping(&self, tenant_id: &TenantId) -> Result<SchemaMapping> {
        let rows = SchemaMappingEntity::find()
            .filter(SchemaMappingColumn::TenantId.eq(tenant_id.as_str()))
            .order_by_asc(SchemaMappingColumn::FieldName)
            .all(self.read_conn())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.field_name, FieldLocation::new(row.table_name, row.column_name)))
            .collect())
    }

    /// Replace a tenant's mapping set wholesale
    pub async fn replace_mapping(&self, tenant_id: &TenantId, mapping: &SchemaMapping) -> Result<()> {
        let txn = self.write_conn().begin().await?;

        let removed = SchemaMappingEntity::delete_many()
            .filter(SchemaMappingColumn::TenantId.eq(tenant_id.as_str()))
            .exec(&txn)
            .await?;

        if !mapping.is_empty() {
            let rows = mapping.iter().map(|(field, location)| SchemaMappingActiveModel {
                tenant_id: Set(tenant_id.to_string()),
                field_name: Set(field.trim().to_string()),
                table_name: Set(location.table.trim().to_string()),
                column_name: Set(location.column.trim().to_string()),
                ..Default::default()
            });
            SchemaMappingEntity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;

        info!(
            tenant_id = %tenant_id,
            removed = removed.rows_affected,
            saved = mapping.len(),
            "Schema mapping replaced"
        );
        Ok(())
    }

    // ========================================================================
    // Module Operations
    // ========================================================================

    /// List a tenant's modules in id order
    pub async fn list_modules(&self, tenant_id: &TenantId, include_hidden: bool) -> Result<Vec<SavedModule>> {
        let mut query = SavedModuleEntity::find().filter(SavedModuleColumn::TenantId.eq(tenant_id.as_str()));
        if !include_hidden {
            query = query.filter(SavedModuleColumn::IsHidden.eq(false));
        }

        query
            .order_by_asc(SavedModuleColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find a module owned by the tenant
    pub async fn find_module(&self, tenant_id: &TenantId, id: i64) -> Result<Option<SavedModule>> {
        SavedModuleEntity::find_by_id(id)
            .filter(SavedModuleColumn::TenantId.eq(tenant_id.as_str()))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Insert a new module
    pub async fn insert_module(
        &self,
        tenant_id: &TenantId,
        title: &str,
        sql_text: &str,
        visualization: VisualizationType,
        origin_ip: Option<&str>,
    ) -> Result<SavedModule> {
        let txn = self.write_conn().begin().await?;
        lock_tenant_modules(&txn, tenant_id.as_str()).await?;

        let copy = ModuleCopy {
            source_id: 0,
            title: title.to_string(),
            sql_text: sql_text.to_string(),
            visualization_type: visualization,
        };
        let module = copy_into(&copy, tenant_id.as_str(), origin_ip).insert(&txn).await?;

        txn.commit().await?;
        debug!(tenant_id = %tenant_id, module_id = module.id, "Module inserted");
        Ok(module)
    }

    /// Update a module by id, only if the tenant owns it
    pub async fn update_module(
        &self,
        tenant_id: &TenantId,
        id: i64,
        title: &str,
        sql_text: &str,
        visualization: VisualizationType,
        origin_ip: Option<&str>,
    ) -> Result<SavedModule> {
        let txn = self.write_conn().begin().await?;
        lock_tenant_modules(&txn, tenant_id.as_str()).await?;

        let existing = SavedModuleEntity::find_by_id(id)
            .filter(SavedModuleColumn::TenantId.eq(tenant_id.as_str()))
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::ModuleNotFound { id: id.to_string() })?;

        let updated_at = next_updated_at(existing.updated_at, Utc::now().fixed_offset());

        let mut model = existing.into_active_model();
        model.title = Set(title.to_string());
        model.sql_text = Set(sql_text.to_string());
        model.visualization_type = Set(visualization.as_str().to_string());
        model.updated_at = Set(updated_at);
        if let Some(ip) = origin_ip {
            model.origin_ip = Set(Some(ip.to_string()));
        }

        let module = model.update(&txn).await?;
        txn.commit().await?;
        debug!(tenant_id = %tenant_id, module_id = id, "Module updated");
        Ok(module)
    }

    /// Delete a module; scoped to one tenant when `tenant_id` is given
    pub async fn delete_module(&self, id: i64, tenant_id: Option<&TenantId>) -> Result<bool> {
        let mut query = SavedModuleEntity::delete_many().filter(SavedModuleColumn::Id.eq(id));
        if let Some(tenant_id) = tenant_id {
            query = query.filter(SavedModuleColumn::TenantId.eq(tenant_id.as_str()));
        }

        let result = query.exec(self.write_conn()).await?;
        Ok(result.rows_affected > 0)
    }

    /// Show or hide a module in tenant listings
    pub async fn set_module_hidden(&self, id: i64, hidden: bool) -> Result<SavedModule> {
        let existing = SavedModuleEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::ModuleNotFound { id: id.to_string() })?;

        let mut model = existing.into_active_model();
        model.is_hidden = Set(hidden);

        model.update(self.write_conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Transfer Operations
    // ========================================================================

    /// Copy modules between tenants.
    ///
    /// Duplicate detection and the resulting writes share one transaction,
    /// with the target tenant's module lock held throughout.
    pub async fn transfer_modules(&self, request: &TransferRequest, origin_ip: Option<&str>) -> Result<TransferOutcome> {
        request.check()?;
        if request.action == TransferAction::Cancel {
            return Ok(TransferOutcome::Cancelled);
        }

        let source_tenant = request.source_tenant_id.trim();
        let target_tenant = request.target_tenant_id.trim();
        let ids = request.unique_module_ids();

        let txn = self.write_conn().begin().await?;
        lock_tenant_modules(&txn, target_tenant).await?;

        let source = SavedModuleEntity::find()
            .filter(SavedModuleColumn::TenantId.eq(source_tenant))
            .filter(SavedModuleColumn::Id.is_in(ids.clone()))
            .order_by_asc(SavedModuleColumn::Id)
            .all(&txn)
            .await?;

        if let Some(missing) = ids.iter().find(|id| !source.iter().any(|m| m.id == **id)) {
            return Err(AppError::ModuleNotFound { id: missing.to_string() });
        }

        let target = SavedModuleEntity::find()
            .filter(SavedModuleColumn::TenantId.eq(target_tenant))
            .all(&txn)
            .await?;

        let plan = plan_transfer(request.action, &source, &target);

        if !plan.deletes.is_empty() {
            SavedModuleEntity::delete_many()
                .filter(SavedModuleColumn::TenantId.eq(target_tenant))
                .filter(SavedModuleColumn::Id.is_in(plan.deletes.clone()))
                .exec(&txn)
                .await?;
        }

        if !plan.copies.is_empty() {
            let rows = plan
                .copies
                .iter()
                .map(|copy| copy_into(copy, target_tenant, origin_ip));
            SavedModuleEntity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;

        info!(
            source_tenant = source_tenant,
            target_tenant = target_tenant,
            action = %request.action,
            deleted = plan.deletes.len(),
            inserted = plan.copies.len(),
            "Module transfer applied"
        );

        Ok(plan.outcome)
    }
}
