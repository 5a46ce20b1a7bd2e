//! Job store database configuration.

use crate::config::helpers::{optional_env, parse_optional_env, required_env};
use crate::error::ConfigError;

/// PostgreSQL connection configuration for the Job Store Gateway.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
    /// Back-off applied by the poller on transient disconnect (§7): 10s
    /// normally, 30s once a "lost connection" error has been observed.
    pub backoff_normal_secs: u64,
    pub backoff_lost_connection_secs: u64,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let url = required_env(
            "DATABASE_URL",
            "Set DATABASE_URL to a postgres:// connection string",
        )?;
        let pool_size = parse_optional_env("DATABASE_POOL_SIZE", 10usize)?;
        let backoff_normal_secs = parse_optional_env("DB_BACKOFF_NORMAL_SECS", 10u64)?;
        let backoff_lost_connection_secs =
            parse_optional_env("DB_BACKOFF_LOST_CONNECTION_SECS", 30u64)?;

        let _ = optional_env("DATABASE_SSLMODE")?;

        Ok(Self {
            url,
            pool_size,
            backoff_normal_secs,
            backoff_lost_connection_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_requires_database_url() {
        // SAFETY: test-local env mutation, no concurrent access in this process's test run.
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        let err = DatabaseConfig::resolve().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }
}
