//! Configuration loading from environment.
//!
//! All tunables are read once at startup; nothing in the core consults the
//! environment after construction.

use std::env;
use std::time::Duration;

use crate::error::Result;

/// Default per-user open-ticket limit when a guild has not configured one.
/// Zero means unlimited.
pub const DEFAULT_MAX_OPEN_TICKETS: u32 = 0;

/// Default auto-close delay for close requests that carry a deadline.
pub const DEFAULT_AUTOCLOSE_HOURS: u32 = 72;

/// Main configuration for the ticketd backend.
#[derive(Debug, Clone)]
pub struct TicketdConfig {
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Port for the health check endpoint.
    pub health_port: u16,
    /// Transaction tuning.
    pub transaction: TxConfig,
    /// Auto-close delay applied when a close request does not specify one.
    pub default_autoclose_hours: u32,
    /// Development-only permission override, parsed from
    /// `TICKETD_PERMISSION_OVERRIDE` (hex mask). Compiled out of release builds.
    #[cfg(feature = "dev-permission-override")]
    pub permission_override: Option<crate::permissions::PermissionSet>,
}

/// Transaction timeout bounds.
#[derive(Debug, Clone, Copy)]
pub struct TxConfig {
    /// Maximum wait to acquire a pool connection.
    pub acquire_timeout: Duration,
    /// SQLite busy timeout: bounded wait on a locked database.
    pub busy_timeout: Duration,
    /// Overall ceiling on one transactional unit of work.
    pub total_timeout: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(5_000),
            busy_timeout: Duration::from_millis(5_000),
            total_timeout: Duration::from_millis(30_000),
        }
    }
}

impl TicketdConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `DATABASE_PATH`: SQLite file path (default: `ticketd.db`)
    /// - `HEALTH_PORT`: health endpoint port (default: 8080)
    /// - `TX_ACQUIRE_TIMEOUT_MS`, `TX_BUSY_TIMEOUT_MS`, `TX_TOTAL_TIMEOUT_MS`
    /// - `DEFAULT_AUTOCLOSE_HOURS`: fallback auto-close delay (default: 72)
    pub fn from_env() -> Result<Self> {
        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "ticketd.db".to_string());

        let health_port = env::var("HEALTH_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let transaction = TxConfig {
            acquire_timeout: millis_var("TX_ACQUIRE_TIMEOUT_MS", 5_000),
            busy_timeout: millis_var("TX_BUSY_TIMEOUT_MS", 5_000),
            total_timeout: millis_var("TX_TOTAL_TIMEOUT_MS", 30_000),
        };

        let default_autoclose_hours = env::var("DEFAULT_AUTOCLOSE_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUTOCLOSE_HOURS);

        Ok(Self {
            database_path,
            health_port,
            transaction,
            default_autoclose_hours,
            #[cfg(feature = "dev-permission-override")]
            permission_override: load_permission_override(),
        })
    }
}

/// Read a millisecond duration from the environment with a default.
fn millis_var(name: &str, default_ms: u64) -> Duration {
    let ms = env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

#[cfg(feature = "dev-permission-override")]
fn load_permission_override() -> Option<crate::permissions::PermissionSet> {
    let raw = env::var("TICKETD_PERMISSION_OVERRIDE").ok()?;
    let set = crate::permissions::PermissionSet::from_hex(raw.trim())?;
    tracing::warn!(
        permissions = %set,
        "development permission override active; all permission resolution is bypassed"
    );
    Some(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn millis_var_default_when_unset() {
        let name = "TEST_TICKETD_MS_UNSET_91814";
        env::remove_var(name);
        assert_eq!(millis_var(name, 1234), Duration::from_millis(1234));
    }

    #[test]
    fn millis_var_parses_value() {
        let name = "TEST_TICKETD_MS_SET_91814";
        env::set_var(name, "250");
        assert_eq!(millis_var(name, 1234), Duration::from_millis(250));
        env::remove_var(name);
    }

    #[test]
    fn millis_var_default_on_garbage() {
        let name = "TEST_TICKETD_MS_BAD_91814";
        env::set_var(name, "not-a-number");
        assert_eq!(millis_var(name, 777), Duration::from_millis(777));
        env::remove_var(name);
    }

    #[test]
    fn from_env_has_sane_defaults() {
        let config = TicketdConfig::from_env().expect("should load");
        assert!(!config.database_path.is_empty());
        assert!(config.transaction.total_timeout >= config.transaction.busy_timeout);
        assert!(config.default_autoclose_hours > 0);
    }
}
