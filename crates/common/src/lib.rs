//! minutechart common library
//!
//! Shared code for the minutechart services including:
//! - Tenant query kernel (connections, execution, aggregate synthesis)
//! - Saved modules, dashboards and cross-tenant transfers
//! - Control-plane database models and repository
//! - Error types and handling
//! - Configuration management
//! - Authentication utilities
//! - Metrics and observability

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod modules;
pub mod tenant;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use errors::{AppError, Result};
pub use modules::ModuleService;
pub use tenant::{ConnectionFactory, TenantContext, TenantId};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
