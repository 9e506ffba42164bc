//! Tenant query kernel
//!
//! Everything that touches a tenant's own database lives here:
//! - Connection profiles and the connection factory
//! - The ad-hoc executor and its dynamic row model
//! - Statement and identifier guards
//! - Schema mappings and aggregate synthesis
//!
//! No call in this module resolves "the current tenant" on its own. Callers
//! pass a [`TenantContext`] explicitly.

pub mod aggregate;
pub mod connection;
pub mod executor;
pub mod guard;
pub mod mapping;
pub mod profile;

pub use aggregate::{AggregateEntry, AggregateFunction, AggregateRequest, AggregateSynthesizer};
pub use connection::{ConnectionFactory, TenantConnection};
pub use executor::{CellValue, QueryRow, QueryRunner, SqlParam};
pub use mapping::{FieldLocation, SchemaMapping};
pub use profile::{AccountStatus, ConnectionProfile};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a caller may run against a tenant database.
///
/// Self-service callers are held to read-only statements; administrative
/// callers may run anything, writes included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub allow_writes: bool,
}

impl ExecutionPolicy {
    pub const READ_ONLY: Self = Self { allow_writes: false };
    pub const UNRESTRICTED: Self = Self { allow_writes: true };

    /// Reject the statement up front if this policy does not permit it
    pub fn check(&self, sql: &str) -> crate::Result<()> {
        if self.allow_writes {
            guard::require_statement(sql)
        } else {
            guard::require_read_only(sql)
        }
    }
}

/// Whose database a kernel call targets, and on whose behalf
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: TenantId,

    /// Recorded as the origin IP of modules written under this context
    pub client_ip: Option<String>,

    pub policy: ExecutionPolicy,
}

impl TenantContext {
    pub fn self_service(tenant_id: TenantId, client_ip: Option<String>) -> Self {
        Self {
            tenant_id,
            client_ip,
            policy: ExecutionPolicy::READ_ONLY,
        }
    }

    pub fn admin(tenant_id: TenantId, client_ip: Option<String>) -> Self {
        Self {
            tenant_id,
            client_ip,
            policy: ExecutionPolicy::UNRESTRICTED,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.policy.allow_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[test]
    fn test_read_only_policy_rejects_writes() {
        let err = ExecutionPolicy::READ_ONLY
            .check("DELETE FROM invoices")
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn test_unrestricted_policy_allows_writes() {
        assert!(ExecutionPolicy::UNRESTRICTED.check("UPDATE invoices SET paid = true").is_ok());
    }

    #[test]
    fn test_both_policies_reject_empty_sql() {
        assert!(ExecutionPolicy::READ_ONLY.check("   ").is_err());
        assert!(ExecutionPolicy::UNRESTRICTED.check("").is_err());
    }

    #[test]
    fn test_tenant_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&TenantId::new("acme")).unwrap();
        assert_eq!(json, "\"acme\"");
    }
}
