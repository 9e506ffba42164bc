//! Administrative handlers
//!
//! Every handler here requires the `admin` scope. Tenant-scoped routes act on
//! the tenant named in the path with writes allowed and unfiltered errors.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::handlers::query::{ExecuteRequest, ExecuteResponse};
use crate::AppState;
use minutechart_common::{
    auth::{AuthContext, ADMIN_SCOPE},
    errors::Result,
    modules::{ModuleView, ProfileInput, ProfileView, SaveModuleRequest, TransferRequest, TransferResponse},
    tenant::{AccountStatus, AggregateEntry, AggregateRequest, SchemaMapping, TenantId},
};

#[derive(Debug, Serialize)]
pub struct ConnectionTestResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AccountStatus,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub hidden: bool,
}

/// Verify connection details without saving them
pub async fn test_connection(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(input): Json<ProfileInput>,
) -> Result<Json<ConnectionTestResponse>> {
    auth.require_scope(ADMIN_SCOPE)?;
    state.modules.test_connection(&input).await?;

    Ok(Json(ConnectionTestResponse {
        success: true,
        message: format!("Connected to {} on {}", input.database, input.server),
    }))
}

pub async fn get_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
) -> Result<Json<ProfileView>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let profile = state.modules.get_profile(&TenantId::from(tenant_id)).await?;
    Ok(Json(ProfileView::from(&profile)))
}

/// Test then store a tenant's connection profile
pub async fn set_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(input): Json<ProfileInput>,
) -> Result<Json<ProfileView>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let profile = state.modules.set_profile(&TenantId::from(tenant_id), &input).await?;

    tracing::info!(
        tenant_id = %profile.tenant_id,
        admin = %auth.user_id,
        refresh_interval_ms = profile.refresh_interval_ms,
        "Tenant profile updated"
    );

    Ok(Json(ProfileView::from(&profile)))
}

pub async fn set_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<ProfileView>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let profile = state
        .modules
        .set_status(&TenantId::from(tenant_id), request.status)
        .await?;
    Ok(Json(ProfileView::from(&profile)))
}

pub async fn get_mappings(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
) -> Result<Json<SchemaMapping>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let mapping = state.modules.get_mapping(&TenantId::from(tenant_id)).await?;
    Ok(Json(mapping))
}

/// Replace the tenant's whole mapping set
pub async fn replace_mappings(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(mapping): Json<SchemaMapping>,
) -> Result<Json<SchemaMapping>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let tenant_id = TenantId::from(tenant_id);
    state.modules.replace_mapping(&tenant_id, &mapping).await?;
    Ok(Json(mapping))
}

/// All of a tenant's modules, hidden ones included
pub async fn list_modules(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<ModuleView>>> {
    let ctx = auth.admin_for(tenant_id)?;
    let modules = state.modules.list_modules(&ctx).await?;
    Ok(Json(modules.iter().map(|m| state.modules.present(m)).collect()))
}

/// Save a module for a tenant; any statement is allowed
pub async fn save_module(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(request): Json<SaveModuleRequest>,
) -> Result<(StatusCode, Json<ModuleView>)> {
    let ctx = auth.admin_for(tenant_id)?;
    let created = request.id.filter(|id| *id > 0).is_none();

    let module = state.modules.save_module(&ctx, &request).await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(state.modules.present(&module))))
}

pub async fn execute(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    let ctx = auth.admin_for(tenant_id)?;
    request.validate()?;

    let rows = state.modules.execute(&ctx, &request.sql).await?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        admin = %auth.user_id,
        rows = rows.len(),
        "Admin statement executed"
    );

    Ok(Json(ExecuteResponse::rows(rows)))
}

pub async fn aggregate(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(tenant_id): Path<String>,
    Json(request): Json<AggregateRequest>,
) -> Result<Json<Vec<AggregateEntry>>> {
    let ctx = auth.admin_for(tenant_id)?;
    let entries = state.modules.aggregate(&ctx, &request).await?;
    Ok(Json(entries))
}

/// Hide a module from tenant listings, or show it again
pub async fn set_visibility(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i64>,
    Json(request): Json<VisibilityRequest>,
) -> Result<Json<ModuleView>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let module = state.modules.set_hidden(id, request.hidden).await?;
    Ok(Json(state.modules.present(&module)))
}

pub async fn delete_module(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    auth.require_scope(ADMIN_SCOPE)?;
    state.modules.delete_module(None, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Copy modules from one tenant to another
pub async fn transfer(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferResponse>> {
    auth.require_scope(ADMIN_SCOPE)?;
    let outcome = state
        .modules
        .transfer(&request, auth.client_ip.as_deref())
        .await?;
    Ok(Json(TransferResponse::from(outcome)))
}
