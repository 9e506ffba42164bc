//! Self-service ad-hoc execution and aggregates

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use minutechart_common::{
    auth::AuthContext,
    errors::Result,
    tenant::{AggregateEntry, AggregateRequest, QueryRow},
};

#[derive(Debug, Deserialize, Validate)]
pub struct ExecuteRequest {
    #[validate(length(min = 1, message = "sql is required"))]
    pub sql: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub data: Vec<QueryRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecuteResponse {
    pub fn rows(data: Vec<QueryRow>) -> Self {
        let message = data.is_empty().then(|| "Query returned no rows".to_string());
        Self {
            success: true,
            data,
            message,
        }
    }
}

/// Run read-only SQL against the caller's own database
pub async fn execute(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    request.validate()?;
    let ctx = auth.self_service();

    let rows = state.modules.execute(&ctx, &request.sql).await?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        request_id = %auth.request_id,
        rows = rows.len(),
        "Ad-hoc query executed"
    );

    Ok(Json(ExecuteResponse::rows(rows)))
}

/// Ranked aggregate over the caller's schema mapping
pub async fn aggregate(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<AggregateRequest>,
) -> Result<Json<Vec<AggregateEntry>>> {
    let ctx = auth.self_service();
    let entries = state.modules.aggregate(&ctx, &request).await?;
    Ok(Json(entries))
}
