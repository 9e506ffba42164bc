//! Per-request connections to tenant databases
//!
//! Every call opens its own connection from the stored profile and closes it
//! when the handle is dropped. Pooling, if any, is the driver's business.

use crate::config::TenantDbConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, Executor, PgConnection, Postgres};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::executor::{decode_row, driver_message, QueryRow, QueryRunner, SqlParam};
use super::profile::{AccountStatus, ConnectionProfile};
use super::{ExecutionPolicy, TenantId};

/// Opens tenant connections under the configured timeouts
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    config: TenantDbConfig,
}

impl ConnectionFactory {
    pub fn new(config: TenantDbConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TenantDbConfig {
        &self.config
    }

    /// Driver options for a profile; incomplete profiles are `NotConfigured`
    fn connect_options(&self, profile: &ConnectionProfile) -> Result<PgConnectOptions> {
        if !profile.is_complete() {
            return Err(AppError::NotConfigured {
                tenant_id: profile.tenant_id.to_string(),
            });
        }

        let (host, port) = split_server(&profile.server, self.config.default_port)?;
        let statement_timeout_ms = self.config.command_timeout().as_millis().to_string();

        Ok(PgConnectOptions::new_without_pgpass()
            .host(&host)
            .port(port)
            .database(profile.database.trim())
            .username(profile.username.trim())
            .password(&profile.password)
            .application_name("minutechart")
            .options([("statement_timeout", statement_timeout_ms)]))
    }

    /// Open a live connection for the profile's tenant
    pub async fn open(&self, profile: &ConnectionProfile) -> Result<TenantConnection> {
        let options = self.connect_options(profile)?;
        let started = Instant::now();

        let connected = tokio::time::timeout(
            self.config.connect_timeout(),
            PgConnection::connect_with(&options),
        )
        .await;

        let conn = match connected {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                let message = driver_message(&e);
                warn!(
                    tenant_id = %profile.tenant_id,
                    server = %profile.server,
                    database = %profile.database,
                    error = %message,
                    "Tenant database connection failed"
                );
                metrics::record_connection(false);
                return Err(AppError::ConnectFailed { message });
            }
            Err(_) => {
                warn!(
                    tenant_id = %profile.tenant_id,
                    server = %profile.server,
                    timeout_secs = self.config.connect_timeout_secs,
                    "Tenant database connection timed out"
                );
                metrics::record_connection(false);
                return Err(AppError::ConnectFailed {
                    message: format!(
                        "timed out after {}s connecting to {}",
                        self.config.connect_timeout_secs, profile.server
                    ),
                });
            }
        };

        metrics::record_connection(true);
        debug!(
            tenant_id = %profile.tenant_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Tenant database connection opened"
        );

        Ok(TenantConnection {
            tenant_id: profile.tenant_id.clone(),
            conn,
        })
    }

    /// Verify credentials without keeping the connection
    pub async fn test_connection(
        &self,
        server: &str,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let probe = ConnectionProfile {
            tenant_id: TenantId::new("connection-test"),
            server: server.to_string(),
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            refresh_interval_ms: self.config.min_refresh_interval_ms,
            status: AccountStatus::Pending,
        };

        let mut conn = self.open(&probe).await.map_err(|e| match e {
            // A half-filled test form is a bad request, not a missing profile
            AppError::NotConfigured { .. } => AppError::validation(
                "server",
                "Server, database, username and password are all required",
            ),
            other => other,
        })?;

        conn.execute("SELECT 1").await.map_err(|e| AppError::ConnectFailed {
            message: e.to_string(),
        })?;
        conn.close().await;

        info!(server = %server, database = %database, "Tenant connection test succeeded");
        Ok(())
    }
}

/// Split `host`, `host:port` or `host,port` into its parts
pub(crate) fn split_server(server: &str, default_port: u16) -> Result<(String, u16)> {
    let server = server.trim();

    let (host, port) = if let Some((host, port)) = server.rsplit_once(',') {
        (host, Some(port))
    } else if server.matches(':').count() == 1 {
        let (host, port) = server.split_once(':').unwrap_or((server, ""));
        (host, Some(port))
    } else {
        (server, None)
    };

    let port = match port.map(str::trim) {
        None => default_port,
        Some(p) => p.parse::<u16>().map_err(|_| AppError::ConnectFailed {
            message: format!("invalid port '{}' in server '{}'", p, server),
        })?,
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(AppError::ConnectFailed {
            message: format!("no host in server '{}'", server),
        });
    }

    Ok((host.to_string(), port))
}

/// A live connection to one tenant's database
pub struct TenantConnection {
    tenant_id: TenantId,
    conn: PgConnection,
}

impl TenantConnection {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Close politely; dropping the handle also closes it
    pub async fn close(self) {
        if let Err(e) = self.conn.close().await {
            debug!(tenant_id = %self.tenant_id, error = %e, "Error closing tenant connection");
        }
    }
}

/// Attach positional parameters in order
fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Integer(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

impl TenantConnection {
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        policy: ExecutionPolicy,
    ) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
        if !policy.allow_writes {
            // Extended protocol takes exactly one statement, and the
            // transaction refuses writes even from functions it calls.
            let mut tx = self.conn.begin().await?;
            sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
            let rows = bind_params(sqlx::query(sql), params).fetch_all(&mut *tx).await?;
            tx.rollback().await?;
            return Ok(rows);
        }

        if params.is_empty() {
            // Simple protocol, so admin scripts with several statements run as written
            (&mut self.conn).fetch_all(sqlx::raw_sql(sql)).await
        } else {
            bind_params(sqlx::query(sql), params).fetch_all(&mut self.conn).await
        }
    }
}

#[async_trait]
impl QueryRunner for TenantConnection {
    async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<QueryRow>> {
        self.run_with(sql, params, ExecutionPolicy::UNRESTRICTED).await
    }

    async fn run_with(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        policy: ExecutionPolicy,
    ) -> Result<Vec<QueryRow>> {
        policy.check(sql)?;

        let started = Instant::now();
        debug!(
            tenant_id = %self.tenant_id,
            sql = %sql,
            params = params.len(),
            read_only = !policy.allow_writes,
            "Executing tenant statement"
        );

        let fetched = self.fetch(sql, params, policy).await;

        let elapsed = started.elapsed();
        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                let message = driver_message(&e);
                warn!(
                    tenant_id = %self.tenant_id,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %message,
                    "Tenant statement failed"
                );
                metrics::record_query(elapsed.as_secs_f64(), false);
                return Err(AppError::Execution { message });
            }
        };

        metrics::record_query(elapsed.as_secs_f64(), true);
        debug!(
            tenant_id = %self.tenant_id,
            rows = rows.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Tenant statement completed"
        );

        rows.iter().map(decode_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ConnectionFactory {
        ConnectionFactory::new(TenantDbConfig::default())
    }

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            tenant_id: TenantId::new("acme"),
            server: "db.acme.internal".into(),
            database: "sales".into(),
            username: "report".into(),
            password: "hunter2".into(),
            refresh_interval_ms: 60_000,
            status: AccountStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_open_with_missing_field_is_not_configured() {
        let mut p = profile();
        p.password = String::new();

        // Fails before any network activity, so no timeout is involved
        let err = factory().open(&p).await.err().expect("must fail");
        assert!(matches!(err, AppError::NotConfigured { ref tenant_id } if tenant_id == "acme"));
    }

    #[tokio::test]
    async fn test_each_missing_field_is_not_configured() {
        for blank in 0..4 {
            let mut p = profile();
            match blank {
                0 => p.server.clear(),
                1 => p.database.clear(),
                2 => p.username.clear(),
                _ => p.password.clear(),
            }
            let err = factory().open(&p).await.err().expect("must fail");
            assert!(matches!(err, AppError::NotConfigured { .. }));
        }
    }

    #[tokio::test]
    async fn test_connection_test_with_blank_fields_is_validation() {
        let err = factory()
            .test_connection("db", "", "user", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn test_split_server_forms() {
        assert_eq!(split_server("db.local", 5432).unwrap(), ("db.local".to_string(), 5432));
        assert_eq!(split_server("db.local:6543", 5432).unwrap(), ("db.local".to_string(), 6543));
        assert_eq!(split_server("db.local,1433", 5432).unwrap(), ("db.local".to_string(), 1433));
        assert_eq!(split_server(" 10.0.0.5 ", 5432).unwrap(), ("10.0.0.5".to_string(), 5432));
    }

    #[test]
    fn test_split_server_rejects_bad_port() {
        assert!(matches!(
            split_server("db.local:abc", 5432),
            Err(AppError::ConnectFailed { .. })
        ));
        assert!(split_server(":5432", 5432).is_err());
    }

    #[test]
    fn test_connect_options_accepts_complete_profile() {
        assert!(factory().connect_options(&profile()).is_ok());
    }
}
