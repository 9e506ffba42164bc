//! Self-service module handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::handlers::query::ExecuteResponse;
use crate::AppState;
use minutechart_common::{
    auth::AuthContext,
    errors::Result,
    modules::{ModuleView, SaveModuleRequest},
};

/// List the caller's visible modules
pub async fn list_modules(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Vec<ModuleView>>> {
    let ctx = auth.self_service();
    let modules = state.modules.list_modules(&ctx).await?;
    Ok(Json(modules.iter().map(|m| state.modules.present(m)).collect()))
}

/// Create or update a module after running its SQL once
pub async fn save_module(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<SaveModuleRequest>,
) -> Result<(StatusCode, Json<ModuleView>)> {
    let ctx = auth.self_service();
    let created = request.id.filter(|id| *id > 0).is_none();

    let module = state.modules.save_module(&ctx, &request).await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(state.modules.present(&module))))
}

/// Get one of the caller's modules
pub async fn get_module(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i64>,
) -> Result<Json<ModuleView>> {
    let module = state.modules.get_module(&auth.self_service(), id).await?;
    Ok(Json(state.modules.present(&module)))
}

/// Delete one of the caller's modules
pub async fn delete_module(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    state.modules.delete_module(Some(&auth.tenant_id), id).await?;

    tracing::info!(
        module_id = id,
        tenant_id = %auth.tenant_id,
        "Module deleted by tenant"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// Run a saved module and return its rows
pub async fn module_data(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<i64>,
) -> Result<Json<ExecuteResponse>> {
    let rows = state.modules.run_module(&auth.self_service(), id).await?;
    Ok(Json(ExecuteResponse::rows(rows)))
}
