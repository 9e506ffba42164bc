//! Kernel operations over saved modules and tenant databases
//!
//! [`ModuleService`] ties the control-plane repository to the tenant
//! connection factory. Every operation takes an explicit [`TenantContext`]
//! (or a tenant id on admin-only paths); nothing resolves the tenant on its
//! own.

pub mod transfer;

pub use transfer::{
    plan_transfer, DuplicateModule, TransferAction, TransferOutcome, TransferPlan, TransferRequest,
    TransferResponse,
};

use crate::db::models::{SavedModule, VisualizationType};
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::tenant::profile::clamp_refresh_interval;
use crate::tenant::{
    AccountStatus, AggregateEntry, AggregateRequest, AggregateSynthesizer, ConnectionFactory, ConnectionProfile,
    QueryRow, QueryRunner, SchemaMapping, TenantConnection, TenantContext, TenantId,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

fn default_visualization() -> String {
    VisualizationType::Table.as_str().to_string()
}

/// Module create/update input
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveModuleRequest {
    /// Absent or zero inserts a new module
    #[serde(default)]
    pub id: Option<i64>,

    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,

    #[validate(length(min = 1, message = "sqlText is required"))]
    pub sql_text: String,

    #[serde(default = "default_visualization")]
    pub visualization_type: String,
}

impl SaveModuleRequest {
    fn existing_id(&self) -> Option<i64> {
        self.id.filter(|id| *id > 0)
    }
}

/// Connection details supplied by an administrator
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInput {
    #[validate(length(min = 1, message = "server is required"))]
    pub server: String,

    #[validate(length(min = 1, message = "database is required"))]
    pub database: String,

    #[validate(length(min = 1, message = "username is required"))]
    pub username: String,

    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,

    #[serde(default)]
    pub refresh_interval_ms: Option<i64>,
}

/// A profile as shown to administrators, password withheld
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub tenant_id: TenantId,
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: &'static str,
    pub refresh_interval_ms: i64,
    pub status: AccountStatus,
}

impl From<&ConnectionProfile> for ProfileView {
    fn from(profile: &ConnectionProfile) -> Self {
        Self {
            tenant_id: profile.tenant_id.clone(),
            server: profile.server.clone(),
            database: profile.database.clone(),
            username: profile.username.clone(),
            password: "***",
            refresh_interval_ms: profile.refresh_interval_ms,
            status: profile.status,
        }
    }
}

/// A saved module with timestamps in the reporting timezone
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleView {
    pub id: i64,
    pub title: String,
    pub sql_text: String,
    pub visualization_type: VisualizationType,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_ip: Option<String>,
    pub is_hidden: bool,
}

impl ModuleView {
    pub fn new(module: &SavedModule, offset: &FixedOffset) -> Self {
        Self {
            id: module.id,
            title: module.title.clone(),
            sql_text: module.sql_text.clone(),
            visualization_type: module.visualization(),
            created_at: module.created_at.with_timezone(offset),
            updated_at: module.updated_at.with_timezone(offset),
            origin_ip: module.origin_ip.clone(),
            is_hidden: module.is_hidden,
        }
    }
}

/// One module's output on a dashboard
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleResult {
    #[serde(flatten)]
    pub module: ModuleView,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<QueryRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub refresh_interval_ms: i64,
    pub modules: Vec<ModuleResult>,
}

/// Error as the caller is allowed to see it
fn surface(ctx: &TenantContext, err: AppError) -> AppError {
    if ctx.is_admin() {
        err
    } else {
        err.for_tenant()
    }
}

/// Run each module in turn; one module failing leaves the rest untouched
pub async fn render_modules<R>(
    runner: &mut R,
    ctx: &TenantContext,
    modules: &[SavedModule],
    offset: &FixedOffset,
) -> Vec<ModuleResult>
where
    R: QueryRunner + ?Sized,
{
    let mut results = Vec::with_capacity(modules.len());

    for module in modules {
        let outcome = runner.run_with(&module.sql_text, &[], ctx.policy).await;

        let view = ModuleView::new(module, offset);
        results.push(match outcome {
            Ok(rows) => ModuleResult {
                module: view,
                success: true,
                data: Some(rows),
                message: None,
            },
            Err(e) => {
                warn!(
                    tenant_id = %ctx.tenant_id,
                    module_id = module.id,
                    error = %e,
                    "Dashboard module failed"
                );
                ModuleResult {
                    module: view,
                    success: false,
                    data: None,
                    message: Some(surface(ctx, e).to_string()),
                }
            }
        });
    }

    results
}

/// Saved modules, ad-hoc execution, aggregates and tenant administration
#[derive(Clone)]
pub struct ModuleService {
    repo: Repository,
    factory: ConnectionFactory,
}

impl ModuleService {
    pub fn new(repo: Repository, factory: ConnectionFactory) -> Self {
        Self { repo, factory }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn reporting_offset(&self) -> FixedOffset {
        self.factory.config().reporting_offset()
    }

    pub fn present(&self, module: &SavedModule) -> ModuleView {
        ModuleView::new(module, &self.reporting_offset())
    }

    // ========================================================================
    // Tenant connections
    // ========================================================================

    /// Profile for the context's tenant; self-service also needs an active account
    async fn usable_profile(&self, ctx: &TenantContext) -> Result<ConnectionProfile> {
        let profile = self
            .repo
            .get_profile(&ctx.tenant_id)
            .await?
            .ok_or_else(|| AppError::NotConfigured {
                tenant_id: ctx.tenant_id.to_string(),
            })?;

        if !ctx.is_admin() && profile.status != AccountStatus::Active {
            return Err(AppError::AccountInactive {
                tenant_id: ctx.tenant_id.to_string(),
                status: profile.status.as_str().to_string(),
            });
        }

        Ok(profile)
    }

    async fn connect(&self, ctx: &TenantContext) -> Result<TenantConnection> {
        let profile = self.usable_profile(ctx).await?;
        self.factory.open(&profile).await
    }

    /// Run one statement and hand back its rows
    async fn run_once(&self, ctx: &TenantContext, sql: &str) -> Result<Vec<QueryRow>> {
        let mut conn = self.connect(ctx).await?;
        let result = conn.run_with(sql, &[], ctx.policy).await;
        conn.close().await;
        result.map_err(|e| surface(ctx, e))
    }

    // ========================================================================
    // Ad-hoc execution and aggregates
    // ========================================================================

    /// Execute caller-supplied SQL; the policy check happens before any I/O
    pub async fn execute(&self, ctx: &TenantContext, sql: &str) -> Result<Vec<QueryRow>> {
        ctx.policy.check(sql)?;
        self.run_once(ctx, sql).await
    }

    /// Ranked aggregate over mapped fields; unmapped keys give an empty list
    pub async fn aggregate(&self, ctx: &TenantContext, request: &AggregateRequest) -> Result<Vec<AggregateEntry>> {
        request.validate()?;
        let mapping = self.repo.get_mapping(&ctx.tenant_id).await?;

        let Some(query) = AggregateSynthesizer::build(&mapping, request)? else {
            info!(tenant_id = %ctx.tenant_id, "Aggregate keys not mapped for tenant");
            return Ok(Vec::new());
        };

        let mut conn = self.connect(ctx).await?;
        let result = AggregateSynthesizer::fetch(&mut conn, &query, request.top_n()).await;
        conn.close().await;

        result.map_err(|e| surface(ctx, e))
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Tenant listings skip hidden modules; admin listings include them
    pub async fn list_modules(&self, ctx: &TenantContext) -> Result<Vec<SavedModule>> {
        self.repo.list_modules(&ctx.tenant_id, ctx.is_admin()).await
    }

    pub async fn get_module(&self, ctx: &TenantContext, id: i64) -> Result<SavedModule> {
        self.repo
            .find_module(&ctx.tenant_id, id)
            .await?
            .filter(|m| ctx.is_admin() || !m.is_hidden)
            .ok_or_else(|| AppError::ModuleNotFound { id: id.to_string() })
    }

    /// Validate by execution, then insert or update.
    ///
    /// Updates only ever touch a module the context's tenant owns.
    pub async fn save_module(&self, ctx: &TenantContext, request: &SaveModuleRequest) -> Result<SavedModule> {
        request.validate()?;
        let visualization: VisualizationType = request.visualization_type.parse()?;
        ctx.policy.check(&request.sql_text)?;

        let existing = request.existing_id();
        if let Some(id) = existing {
            self.get_module(ctx, id).await?;
        }

        self.run_once(ctx, &request.sql_text).await?;

        let origin_ip = ctx.client_ip.as_deref();
        let module = match existing {
            Some(id) => {
                self.repo
                    .update_module(&ctx.tenant_id, id, &request.title, &request.sql_text, visualization, origin_ip)
                    .await?
            }
            None => {
                self.repo
                    .insert_module(&ctx.tenant_id, &request.title, &request.sql_text, visualization, origin_ip)
                    .await?
            }
        };

        metrics::record_module_save(existing.is_none());
        info!(
            tenant_id = %ctx.tenant_id,
            module_id = module.id,
            created = existing.is_none(),
            "Module saved"
        );

        Ok(module)
    }

    /// Delete a module; `tenant_id` scopes the delete to one owner
    pub async fn delete_module(&self, tenant_id: Option<&TenantId>, id: i64) -> Result<()> {
        if !self.repo.delete_module(id, tenant_id).await? {
            return Err(AppError::ModuleNotFound { id: id.to_string() });
        }
        info!(module_id = id, "Module deleted");
        Ok(())
    }

    pub async fn set_hidden(&self, id: i64, hidden: bool) -> Result<SavedModule> {
        let module = self.repo.set_module_hidden(id, hidden).await?;
        info!(module_id = id, hidden = hidden, "Module visibility changed");
        Ok(module)
    }

    /// Execute one saved module
    pub async fn run_module(&self, ctx: &TenantContext, id: i64) -> Result<Vec<QueryRow>> {
        let module = self.get_module(ctx, id).await?;
        ctx.policy.check(&module.sql_text)?;
        self.run_once(ctx, &module.sql_text).await
    }

    /// Refresh interval plus every visible module's output
    pub async fn dashboard(&self, ctx: &TenantContext) -> Result<Dashboard> {
        let profile = self.usable_profile(ctx).await?;
        let modules = self.repo.list_modules(&ctx.tenant_id, false).await?;

        let results = if modules.is_empty() {
            Vec::new()
        } else {
            let mut conn = self.factory.open(&profile).await?;
            let results = render_modules(&mut conn, ctx, &modules, &self.reporting_offset()).await;
            conn.close().await;
            results
        };

        let floor = self.factory.config().min_refresh_interval_ms;
        Ok(Dashboard {
            refresh_interval_ms: profile.refresh_interval_ms.max(floor),
            modules: results,
        })
    }

    // ========================================================================
    // Tenant administration
    // ========================================================================

    pub async fn test_connection(&self, input: &ProfileInput) -> Result<()> {
        input.validate()?;
        self.factory
            .test_connection(&input.server, &input.database, &input.username, &input.password)
            .await
    }

    /// Save a profile only once its connection has been verified
    pub async fn set_profile(&self, tenant_id: &TenantId, input: &ProfileInput) -> Result<ConnectionProfile> {
        self.test_connection(input).await?;

        let floor = self.factory.config().min_refresh_interval_ms;
        let status = match self.repo.get_profile(tenant_id).await? {
            Some(existing) if existing.status == AccountStatus::Blocked => AccountStatus::Blocked,
            _ => AccountStatus::Active,
        };

        let profile = ConnectionProfile {
            tenant_id: tenant_id.clone(),
            server: input.server.trim().to_string(),
            database: input.database.trim().to_string(),
            username: input.username.trim().to_string(),
            password: input.password.clone(),
            refresh_interval_ms: clamp_refresh_interval(input.refresh_interval_ms, floor),
            status,
        };

        self.repo.upsert_profile(&profile).await
    }

    pub async fn get_profile(&self, tenant_id: &TenantId) -> Result<ConnectionProfile> {
        self.repo
            .get_profile(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "tenant profile".to_string(),
                id: tenant_id.to_string(),
            })
    }

    pub async fn set_status(&self, tenant_id: &TenantId, status: AccountStatus) -> Result<ConnectionProfile> {
        self.repo.set_status(tenant_id, status).await
    }

    pub async fn get_mapping(&self, tenant_id: &TenantId) -> Result<SchemaMapping> {
        self.repo.get_mapping(tenant_id).await
    }

    /// Replace the tenant's mappings after checking every identifier
    pub async fn replace_mapping(&self, tenant_id: &TenantId, mapping: &SchemaMapping) -> Result<()> {
        mapping.validate()?;
        self.repo.replace_mapping(tenant_id, mapping).await
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    pub async fn transfer(&self, request: &TransferRequest, origin_ip: Option<&str>) -> Result<TransferOutcome> {
        let outcome = self.repo.transfer_modules(request, origin_ip).await?;

        if let TransferOutcome::Completed { copied, .. } = &outcome {
            metrics::record_transfer(request.action.as_str(), *copied);
        }
        info!(
            source_tenant = %request.source_tenant_id,
            target_tenant = %request.target_tenant_id,
            action = %request.action,
            outcome = %outcome.message(),
            "Module transfer finished"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantDbConfig;
    use crate::db::models::SchemaMappingRow;
    use crate::db::DbPool;
    use crate::tenant::{CellValue, SqlParam};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[derive(Default)]
    struct FakeRunner {
        executed: Vec<String>,
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn run(&mut self, sql: &str, _params: &[SqlParam]) -> Result<Vec<QueryRow>> {
            self.executed.push(sql.to_string());
            if sql.contains("missing_table") {
                return Err(AppError::Execution {
                    message: "relation \"missing_table\" does not exist".into(),
                });
            }
            let mut row = QueryRow::new();
            row.push("total", CellValue::Integer(42));
            Ok(vec![row])
        }
    }

    fn module(id: i64, sql: &str) -> SavedModule {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().fixed_offset();
        SavedModule {
            id,
            tenant_id: "acme".into(),
            title: format!("Module {id}"),
            sql_text: sql.into(),
            visualization_type: "kpi".into(),
            created_at: at,
            updated_at: at,
            origin_ip: Some("10.1.1.1".into()),
            is_hidden: false,
        }
    }

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn tenant() -> TenantContext {
        TenantContext::self_service(TenantId::new("acme"), None)
    }

    #[tokio::test]
    async fn test_one_failing_module_does_not_fail_the_rest() {
        let modules = vec![
            module(1, "SELECT 42 AS total"),
            module(2, "SELECT * FROM missing_table"),
            module(3, "SELECT 42 AS total"),
        ];
        let mut runner = FakeRunner::default();

        let results = render_modules(&mut runner, &tenant(), &modules, &ist()).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success);
        let message = results[1].message.as_deref().unwrap();
        assert!(message.starts_with("query validation failed: "));
        assert!(message.contains("missing_table"));
    }

    #[tokio::test]
    async fn test_self_service_dashboard_skips_write_statements() {
        let modules = vec![module(1, "DELETE FROM invoices"), module(2, "select 1")];
        let mut runner = FakeRunner::default();

        let results = render_modules(&mut runner, &tenant(), &modules, &ist()).await;

        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(runner.executed, vec!["select 1".to_string()]);
    }

    #[tokio::test]
    async fn test_admin_sees_raw_driver_message() {
        let ctx = TenantContext::admin(TenantId::new("acme"), None);
        let modules = vec![module(1, "SELECT * FROM missing_table")];
        let mut runner = FakeRunner::default();

        let results = render_modules(&mut runner, &ctx, &modules, &ist()).await;
        let message = results[0].message.as_deref().unwrap();
        assert!(!message.starts_with("query validation failed"));
    }

    #[test]
    fn test_module_view_uses_reporting_offset() {
        let view = ModuleView::new(&module(1, "SELECT 1"), &ist());
        assert_eq!(view.created_at.offset().local_minus_utc(), 330 * 60);
        assert_eq!(view.visualization_type, VisualizationType::Kpi);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["createdAt"], "2024-05-01T15:30:00+05:30");
        assert_eq!(json["sqlText"], "SELECT 1");
    }

    #[test]
    fn test_module_result_flattens_module_fields() {
        let result = ModuleResult {
            module: ModuleView::new(&module(9, "SELECT 1"), &ist()),
            success: false,
            data: None,
            message: Some("boom".into()),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_save_request_validation() {
        let req: SaveModuleRequest = serde_json::from_value(serde_json::json!({
            "title": "",
            "sqlText": "SELECT 1"
        }))
        .unwrap();
        assert!(req.validate().is_err());
        assert_eq!(req.visualization_type, "table");

        let req: SaveModuleRequest = serde_json::from_value(serde_json::json!({
            "id": 0,
            "title": "Revenue",
            "sqlText": "SELECT 1",
            "visualizationType": "bar"
        }))
        .unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.existing_id(), None);
    }

    #[test]
    fn test_profile_view_hides_password() {
        let profile = ConnectionProfile {
            tenant_id: TenantId::new("acme"),
            server: "db".into(),
            database: "sales".into(),
            username: "report".into(),
            password: "hunter2".into(),
            refresh_interval_ms: 60_000,
            status: AccountStatus::Active,
        };
        let json = serde_json::to_string(&ProfileView::from(&profile)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"refreshIntervalMs\":60000"));
    }

    fn service(db: &sea_orm::DatabaseConnection) -> ModuleService {
        ModuleService::new(
            Repository::new(DbPool::from_connection(db.clone())),
            ConnectionFactory::new(TenantDbConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_unmapped_aggregate_needs_no_profile() {
        // Only the mapping lookup is answered; a profile lookup would fail
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<SchemaMappingRow>::new()])
            .into_connection();
        let request: AggregateRequest = serde_json::from_value(serde_json::json!({
            "idKey": "CustomerID",
            "nameKey": "CustomerName",
            "valueKey": "TotalSales"
        }))
        .unwrap();

        let entries = service(&db).aggregate(&tenant(), &request).await.unwrap();

        assert!(entries.is_empty());
        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].statements()[0].sql.contains("schema_mappings"));
    }

    #[tokio::test]
    async fn test_stacked_statement_is_refused_before_any_lookup() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();

        let err = service(&db)
            .execute(&tenant(), "SELECT 1; DELETE FROM invoices")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation { .. }));
        assert!(db.into_transaction_log().is_empty());
    }

    #[tokio::test]
    async fn test_dashboard_never_runs_stacked_statements() {
        let modules = vec![module(1, "SELECT 1; DROP TABLE invoices"), module(2, "SELECT 1")];
        let mut runner = FakeRunner::default();

        let results = render_modules(&mut runner, &tenant(), &modules, &ist()).await;

        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(runner.executed, vec!["SELECT 1".to_string()]);
    }
}
