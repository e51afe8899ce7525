//! Configuration management

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use eqlog_common::EqlogError;

use crate::readiness::RetryPolicy;
use crate::storage::{validate_table_name, TABLE_ALLOW_LIST};

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/eqlog";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of attempts to open a locked file.
pub const DEFAULT_READY_MAX_ATTEMPTS: u32 = 10;

/// Default delay between readiness attempts in milliseconds.
pub const DEFAULT_READY_DELAY_MS: u64 = 500;

/// Default budget for reading a whole file in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default codepage of equipment log files.
pub const DEFAULT_ENCODING: &str = "euc-kr";

/// Default reference time zone of the server clock.
pub const DEFAULT_REFERENCE_TZ: &str = "Asia/Seoul";

/// Ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Equipment id of this host
    pub eqpid: String,
    pub database: DatabaseConfig,
    pub ready_max_attempts: u32,
    pub ready_delay_ms: u64,
    pub read_timeout_secs: u64,
    /// `encoding_rs` label
    pub encoding: String,
    pub reference_tz: String,
    pub allow_list_table: String,
    pub delete_on_success: bool,
    /// Open per-file log scopes at debug level
    pub debug: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = IngestConfig {
            eqpid: std::env::var("EQLOG_EQPID").unwrap_or_default().trim().to_string(),
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            ready_max_attempts: env_or("EQLOG_READY_MAX_ATTEMPTS", DEFAULT_READY_MAX_ATTEMPTS),
            ready_delay_ms: env_or("EQLOG_READY_DELAY_MS", DEFAULT_READY_DELAY_MS),
            read_timeout_secs: env_or("EQLOG_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS),
            encoding: std::env::var("EQLOG_ENCODING")
                .unwrap_or_else(|_| DEFAULT_ENCODING.to_string()),
            reference_tz: std::env::var("EQLOG_REFERENCE_TZ")
                .unwrap_or_else(|_| DEFAULT_REFERENCE_TZ.to_string()),
            allow_list_table: std::env::var("EQLOG_ALLOW_LIST_TABLE")
                .unwrap_or_else(|_| TABLE_ALLOW_LIST.to_string()),
            delete_on_success: env_flag("EQLOG_DELETE_ON_SUCCESS", true),
            debug: env_flag("EQLOG_DEBUG", false),
        };

        config.validate()?;

        Ok(config)
    }

    /// Defaults for `eqpid`, without touching the environment.
    pub fn for_equipment(eqpid: impl Into<String>) -> Self {
        Self {
            eqpid: eqpid.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.eqpid.is_empty() {
            anyhow::bail!("EQLOG_EQPID must be set to this equipment's id");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.ready_max_attempts == 0 {
            anyhow::bail!("Readiness max attempts must be greater than 0");
        }

        if self.read_timeout_secs == 0 {
            anyhow::bail!("Read timeout must be greater than 0");
        }

        self.encoding()?;
        validate_table_name(&self.allow_list_table)?;

        if self.reference_tz.trim().is_empty() {
            anyhow::bail!("Reference time zone cannot be empty");
        }

        Ok(())
    }

    /// Resolve the configured codepage label.
    pub fn encoding(&self) -> anyhow::Result<&'static Encoding> {
        Encoding::for_label(self.encoding.trim().as_bytes())
            .ok_or_else(|| EqlogError::Encoding(self.encoding.clone()).into())
    }

    pub fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(
            self.ready_max_attempts,
            Duration::from_millis(self.ready_delay_ms),
        )
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            eqpid: String::new(),
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            ready_max_attempts: DEFAULT_READY_MAX_ATTEMPTS,
            ready_delay_ms: DEFAULT_READY_DELAY_MS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            encoding: DEFAULT_ENCODING.to_string(),
            reference_tz: DEFAULT_REFERENCE_TZ.to_string(),
            allow_list_table: TABLE_ALLOW_LIST.to_string(),
            delete_on_success: true,
            debug: false,
        }
    }
}
