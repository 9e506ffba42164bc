//! Tenant connection profiles

use serde::{Deserialize, Serialize};
use std::fmt;

use super::TenantId;

/// Lifecycle state of a tenant account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Blocked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Active => "active",
            AccountStatus::Blocked => "blocked",
        }
    }
}

impl From<String> for AccountStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => AccountStatus::Active,
            "blocked" => AccountStatus::Blocked,
            _ => AccountStatus::Pending,
        }
    }
}

impl From<AccountStatus> for String {
    fn from(status: AccountStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Everything needed to reach a tenant's database.
///
/// `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub tenant_id: TenantId,
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub refresh_interval_ms: i64,
    pub status: AccountStatus,
}

impl ConnectionProfile {
    /// All four connection fields are present
    pub fn is_complete(&self) -> bool {
        [&self.server, &self.database, &self.username, &self.password]
            .iter()
            .all(|field| !field.trim().is_empty())
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("tenant_id", &self.tenant_id)
            .field("server", &self.server)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("refresh_interval_ms", &self.refresh_interval_ms)
            .field("status", &self.status)
            .finish()
    }
}

/// Raise a requested refresh interval to the configured floor
pub fn clamp_refresh_interval(requested: Option<i64>, floor: i64) -> i64 {
    requested.unwrap_or(floor).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_complete_profile() {
        assert!(profile().is_complete());
    }

    #[test]
    fn test_any_missing_field_makes_profile_incomplete() {
        for blank in 0..4 {
            let mut p = profile();
            match blank {
                0 => p.server = String::new(),
                1 => p.database = " ".into(),
                2 => p.username = String::new(),
                _ => p.password = String::new(),
            }
            assert!(!p.is_complete(), "field {blank} blank should be incomplete");
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", profile());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_refresh_interval_floor() {
        assert_eq!(clamp_refresh_interval(Some(5_000), 60_000), 60_000);
        assert_eq!(clamp_refresh_interval(Some(120_000), 60_000), 120_000);
        assert_eq!(clamp_refresh_interval(None, 60_000), 60_000);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [AccountStatus::Pending, AccountStatus::Active, AccountStatus::Blocked] {
            assert_eq!(AccountStatus::from(String::from(status)), status);
        }
    }
}
