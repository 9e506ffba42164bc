//! Configuration management for Minutechart services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use chrono::{FixedOffset, Offset, Utc};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Floor for a tenant's dashboard refresh interval
pub const MIN_REFRESH_INTERVAL_MS: i64 = 60_000;

/// Indian Standard Time, the reporting timezone of the original deployment
pub const DEFAULT_REPORTING_OFFSET_MINUTES: i32 = 330;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Control-plane database configuration
    pub database: DatabaseConfig,

    /// Tenant database connection policy
    #[serde(default)]
    pub tenant_db: TenantDbConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations at startup
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

/// How tenant databases are reached
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantDbConfig {
    /// Client-side bound on establishing a connection, in seconds
    #[serde(default = "default_tenant_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Server-enforced statement timeout, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Port used when the profile's server has none
    #[serde(default = "default_tenant_port")]
    pub default_port: u16,

    /// Lower bound applied to every tenant's refresh interval
    #[serde(default = "default_min_refresh_interval")]
    pub min_refresh_interval_ms: i64,

    /// Offset of the reporting timezone from UTC, in minutes
    #[serde(default = "default_reporting_offset")]
    pub reporting_utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for token signing
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 90 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_tenant_connect_timeout() -> u64 { 15 }
fn default_command_timeout() -> u64 { 60 }
fn default_tenant_port() -> u16 { 5432 }
fn default_min_refresh_interval() -> i64 { MIN_REFRESH_INTERVAL_MS }
fn default_reporting_offset() -> i32 { DEFAULT_REPORTING_OFFSET_MINUTES }
fn default_jwt_expiration() -> u64 { 3600 }
fn default_request_id_header() -> String { "X-Request-ID".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "minutechart".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl Default for TenantDbConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_tenant_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            default_port: default_tenant_port(),
            min_refresh_interval_ms: default_min_refresh_interval(),
            reporting_utc_offset_minutes: default_reporting_offset(),
        }
    }
}

impl TenantDbConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The reporting timezone; out-of-range offsets fall back to UTC
    pub fn reporting_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.reporting_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // e.g., APP__TENANT_DB__COMMAND_TIMEOUT_SECS=120
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/minutechart".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: default_enabled(),
            },
            tenant_db: TenantDbConfig::default(),
            auth: AuthConfig {
                jwt_secret: None,
                jwt_expiration_secs: default_jwt_expiration(),
                request_id_header: default_request_id_header(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: default_rate_limit(),
                burst: default_burst(),
                enabled: default_enabled(),
            },
        }
    }
}
