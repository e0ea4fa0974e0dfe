//! Configuration management for the client.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tether_engine::{RetryPolicy, TabId};

/// Sync tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a written lease stays valid
    pub lease_ttl_ms: u64,
    /// How often the leader rewrites its lease
    pub renew_interval_ms: u64,
    /// Backoff and dead-letter policy for failed dispatches
    pub retry: RetryPolicy,
    /// Operations loaded per drain step
    pub batch_size: usize,
    /// Concurrent remote calls while draining
    pub fan_out: usize,
    /// How far back the remote change feed can replay
    pub retention_window_ms: u64,
    /// Idle wake-up period of the event loop
    pub poll_interval_ms: u64,
    /// Upper bound on a single remote call
    pub call_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 10_000,
            renew_interval_ms: 3_000,
            retry: RetryPolicy::default(),
            batch_size: 50,
            fan_out: 4,
            retention_window_ms: 7 * 24 * 60 * 60 * 1000,
            poll_interval_ms: 1_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Load overrides from environment variables, keeping defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            lease_ttl_ms: var_or("LEASE_TTL_MS", defaults.lease_ttl_ms)?,
            renew_interval_ms: var_or("RENEW_INTERVAL_MS", defaults.renew_interval_ms)?,
            retry: RetryPolicy {
                base_ms: var_or("BACKOFF_BASE_MS", defaults.retry.base_ms)?,
                cap_ms: var_or("BACKOFF_CAP_MS", defaults.retry.cap_ms)?,
                max_attempts: var_or("MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            },
            batch_size: var_or("BATCH_SIZE", defaults.batch_size)?,
            fan_out: var_or("FAN_OUT", defaults.fan_out)?,
            retention_window_ms: var_or("RETENTION_WINDOW_MS", defaults.retention_window_ms)?,
            poll_interval_ms: var_or("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            call_timeout_ms: var_or("CALL_TIMEOUT_MS", defaults.call_timeout_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check relationships between values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_interval_ms >= self.lease_ttl_ms {
            return Err(ConfigError::RenewIntervalTooLong);
        }
        if self.batch_size == 0 || self.fan_out == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Identity of this tab in the leader lease
    pub tab_id: TabId,
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;
        Self::with_database_url(database_url)
    }

    /// Like [`Config::from_env`], with the database URL given explicitly.
    pub fn with_database_url(database_url: impl Into<String>) -> Result<Self, ConfigError> {
        let tab_id = env::var("TAB_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            database_url: database_url.into(),
            tab_id,
            sync: SyncConfig::from_env()?,
        })
    }
}

fn var_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("RENEW_INTERVAL_MS must be shorter than LEASE_TTL_MS")]
    RenewIntervalTooLong,

    #[error("BATCH_SIZE and FAN_OUT must be at least 1")]
    ZeroConcurrency,
}
