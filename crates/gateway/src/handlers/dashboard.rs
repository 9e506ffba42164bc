//! Tenant dashboard

use axum::{extract::State, Json};

use crate::AppState;
use minutechart_common::{auth::AuthContext, errors::Result, modules::Dashboard};

/// Every visible module with its current data, plus the refresh interval
pub async fn dashboard(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Dashboard>> {
    let ctx = auth.self_service();
    let dashboard = state.modules.dashboard(&ctx).await?;

    tracing::debug!(
        tenant_id = %ctx.tenant_id,
        modules = dashboard.modules.len(),
        failed = dashboard.modules.iter().filter(|m| !m.success).count(),
        "Dashboard rendered"
    );

    Ok(Json(dashboard))
}
