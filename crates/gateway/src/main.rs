//! minutechart API Gateway
//!
//! The HTTP entry point for dashboards and tenant administration.
//! Handles:
//! - Authentication and authorization
//! - Rate limiting
//! - Request routing
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;

use axum::{
    extract::FromRef,
    routing::{delete, get, post, put},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use minutechart_common::{
    auth::JwtManager,
    config::AppConfig,
    db::{DbPool, Repository},
    errors::AppError,
    metrics,
    modules::ModuleService,
    tenant::ConnectionFactory,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DbPool,
    pub modules: ModuleService,
    pub jwt: Arc<JwtManager>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: DbPool, jwt: Arc<JwtManager>) -> Self {
        let modules = ModuleService::new(
            Repository::new(db.clone()),
            ConnectionFactory::new(config.tenant_db.clone()),
        );
        Self { config, db, modules, jwt }
    }
}

impl FromRef<AppState> for Arc<JwtManager> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);

    info!("Starting minutechart API Gateway v{}", minutechart_common::VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    install_metrics_exporter(&config)?;
    metrics::register_metrics();

    // Initialize database connection
    let db = DbPool::new(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }

    let secret = config
        .auth
        .jwt_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Configuration {
            message: "auth.jwt_secret must be set".to_string(),
        })?;
    let jwt = Arc::new(JwtManager::new(secret, config.auth.jwt_expiration_secs));

    // Create app state
    let state = AppState::new(config.clone(), db, jwt);

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Serve Prometheus metrics on their own port; port 0 turns this off
fn install_metrics_exporter(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.observability.metrics_port;
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, port).parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .install()?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Tenant routes, scoped to the caller's own tenant
    let tenant_routes = Router::new()
        .route(
            "/modules",
            get(handlers::modules::list_modules).post(handlers::modules::save_module),
        )
        .route(
            "/modules/{id}",
            get(handlers::modules::get_module).delete(handlers::modules::delete_module),
        )
        .route("/modules/{id}/data", get(handlers::modules::module_data))
        .route("/query", post(handlers::query::execute))
        .route("/aggregate", post(handlers::query::aggregate))
        .route("/dashboard", get(handlers::dashboard::dashboard));

    // Administrative routes, `admin` scope required
    let admin_routes = Router::new()
        .route("/connections/test", post(handlers::admin::test_connection))
        .route(
            "/tenants/{tenant_id}/profile",
            get(handlers::admin::get_profile).put(handlers::admin::set_profile),
        )
        .route("/tenants/{tenant_id}/status", put(handlers::admin::set_status))
        .route(
            "/tenants/{tenant_id}/mappings",
            get(handlers::admin::get_mappings).put(handlers::admin::replace_mappings),
        )
        .route(
            "/tenants/{tenant_id}/modules",
            get(handlers::admin::list_modules).post(handlers::admin::save_module),
        )
        .route("/tenants/{tenant_id}/query", post(handlers::admin::execute))
        .route("/tenants/{tenant_id}/aggregate", post(handlers::admin::aggregate))
        .route("/modules/{id}/visibility", put(handlers::admin::set_visibility))
        .route("/modules/{id}", delete(handlers::admin::delete_module))
        .route("/transfers", post(handlers::admin::transfer));

    let limit = state.config.rate_limit.requests_per_second;
    let limiter = middleware::rate_limit::create_rate_limiter(limit, state.config.rate_limit.burst);
    let mut api_routes = Router::new()
        .merge(tenant_routes)
        .nest("/admin", admin_routes);
    if state.config.rate_limit.enabled {
        api_routes = api_routes.layer(axum::middleware::from_fn(move |req, next| {
            middleware::rate_limit::rate_limit_middleware(req, next, limiter.clone(), limit)
        }));
    }

    // Compose the app
    Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(axum::middleware::from_fn(middleware::metrics::track_requests))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use minutechart_common::tenant::TenantId;
    use sea_orm::DatabaseConnection;
    use tower::ServiceExt;

    const SECRET: &str = "router-test-secret";

    fn app() -> Router {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        let jwt = Arc::new(JwtManager::new(SECRET, 3600));
        let db = DbPool::from_connection(DatabaseConnection::Disconnected);
        create_router(AppState::new(Arc::new(config), db, jwt))
    }

    fn token(scopes: &[&str]) -> String {
        JwtManager::new(SECRET, 3600)
            .generate_token(
                "user-1",
                &TenantId::new("acme"),
                scopes.iter().map(|s| s.to_string()).collect(),
            )
            .unwrap()
    }

    fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_reports_unreachable_control_plane() {
        let response = app()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = app()
            .oneshot(Request::builder().uri("/v1/dashboard").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_self_service_write_is_rejected_before_any_io() {
        // The control plane is disconnected, so reaching storage would fail differently
        let response = app()
            .oneshot(post_json(
                "/v1/query",
                &token(&["tenant"]),
                serde_json::json!({ "sql": "  delete from invoices" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_self_service_save_is_gated_too() {
        let response = app()
            .oneshot(post_json(
                "/v1/modules",
                &token(&["tenant"]),
                serde_json::json!({
                    "title": "Purge",
                    "sqlText": "TRUNCATE invoices",
                    "visualizationType": "table"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_routes_need_admin_scope() {
        let response = app()
            .oneshot(post_json(
                "/v1/admin/tenants/globex/query",
                &token(&["tenant"]),
                serde_json::json!({ "sql": "SELECT 1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_empty_transfer_fails_fast() {
        let response = app()
            .oneshot(post_json(
                "/v1/admin/transfers",
                &token(&["admin"]),
                serde_json::json!({
                    "sourceTenantId": "acme",
                    "targetTenantId": "globex",
                    "moduleIds": [],
                    "action": "check"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
