//! Authentication and authorization utilities
//!
//! Provides:
//! - JWT token generation and validation
//! - Tenant context extraction from the request
//!
//! Identity itself (registration, passwords, confirmation mail) lives outside
//! this service; we only consume signed tokens naming a tenant and its scopes.

use crate::errors::{AppError, Result};
use crate::tenant::{TenantContext, TenantId};
use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::request::Parts,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Scope granting access to the administrative routes
pub const ADMIN_SCOPE: &str = "admin";

/// Extracted authentication context available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Tenant the caller belongs to
    pub tenant_id: TenantId,

    /// Subject of the token
    pub user_id: String,

    /// Scopes/permissions
    pub scopes: Vec<String>,

    /// Caller address, recorded as the origin IP of saved modules
    pub client_ip: Option<String>,

    /// Request ID for tracing
    pub request_id: String,
}

impl AuthContext {
    /// Check if the context has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == ADMIN_SCOPE)
    }

    /// Require a specific scope, returning error if not present
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AppError::Forbidden {
                message: format!("Missing required scope: {}", scope),
            })
        }
    }

    /// Context for a tenant acting on its own database
    pub fn self_service(&self) -> TenantContext {
        TenantContext::self_service(self.tenant_id.clone(), self.client_ip.clone())
    }

    /// Context for an administrator acting on `tenant_id`
    pub fn admin_for(&self, tenant_id: impl Into<TenantId>) -> Result<TenantContext> {
        self.require_scope(ADMIN_SCOPE)?;
        Ok(TenantContext::admin(tenant_id.into(), self.client_ip.clone()))
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Tenant ID
    pub tenant_id: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// JWT token manager
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: expiration_secs as i64,
        }
    }

    /// Generate a new JWT token
    pub fn generate_token(
        &self,
        user_id: &str,
        tenant_id: &TenantId,
        scopes: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiration_secs);

        let claims = JwtClaims {
            sub: user_id.to_string(),
            tenant_id: tenant_id.as_str().to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            scopes,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal {
                message: format!("Failed to generate token: {}", e)
            })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        AppError::ExpiredToken
                    }
                    _ => AppError::InvalidToken,
                }
            })
    }
}

/// Extract the bearer token from an Authorization header
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

/// Resolve the caller address: first hop of X-Forwarded-For, else the socket peer
fn client_ip(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<JwtManager>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        // Extract request ID
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
            })?;

        let token = extract_bearer(auth_header).ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must carry a bearer token".to_string(),
        })?;

        let jwt = <Arc<JwtManager> as FromRef<S>>::from_ref(state);
        let claims = jwt.validate_token(token)?;

        if claims.tenant_id.trim().is_empty() {
            return Err(AppError::Unauthorized {
                message: "Token does not name a tenant".to_string(),
            });
        }

        Ok(AuthContext {
            tenant_id: TenantId::new(claims.tenant_id),
            user_id: claims.sub,
            scopes: claims.scopes,
            client_ip: client_ip(parts),
            request_id,
        })
    }
}
