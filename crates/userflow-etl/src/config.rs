//! Configuration management
//!
//! All settings come from the environment (optionally seeded from a `.env`
//! file) with the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

// ============================================================================
// Extraction Defaults
// ============================================================================

/// Default upstream collection endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://dummyjson.com/users";

/// Default number of records requested per page.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default pause between extraction cycles in seconds.
pub const DEFAULT_SLEEP_INTERVAL_SECS: u64 = 60;

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Default attempts per page fetch.
pub const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;

/// Default delay after the first failed fetch; multiplied by 3 per attempt.
pub const DEFAULT_FETCH_BACKOFF_SECS: u64 = 5;

/// Default checkpoint file location.
pub const DEFAULT_STATE_FILE_PATH: &str = "data/state/extractor_state.json";

// ============================================================================
// File Layout Defaults
// ============================================================================

pub const DEFAULT_RAW_DIR: &str = "data/raw_users";
pub const DEFAULT_PROCESSED_DIR: &str = "data/processed_users";
pub const DEFAULT_DLQ_DIR: &str = "data/dlq";
pub const DEFAULT_LOOKUP_FILE: &str = "data/lookup/departments.csv";

// ============================================================================
// Loading Defaults
// ============================================================================

/// Default SQLite database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://database/data.db";

pub const DEFAULT_REMOTE_HOST: &str = "sftp";
pub const DEFAULT_REMOTE_PORT: u16 = 21;
pub const DEFAULT_REMOTE_USER: &str = "sftp_user";
pub const DEFAULT_REMOTE_DIR: &str = "/upload";

/// Default connection attempts against the remote store.
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between remote connection attempts in seconds.
pub const DEFAULT_UPLOAD_BACKOFF_SECS: u64 = 5;

/// Default TCP connect timeout against the remote store in seconds.
pub const DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub extract: ExtractConfig,
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
}

/// Extraction stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub api_base_url: String,
    pub batch_size: u64,
    pub sleep_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub fetch_max_attempts: u32,
    pub fetch_backoff_secs: u64,
    pub state_file: PathBuf,
}

/// Shared filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub dlq_dir: PathBuf,
    pub lookup_file: PathBuf,
}

/// Relational sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Remote file drop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub remote_dir: String,
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub connect_timeout_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env`, the environment, and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without touching `.env` and without validating
    pub fn from_env() -> Self {
        Config {
            extract: ExtractConfig {
                api_base_url: env_or("API_BASE_URL", DEFAULT_API_BASE_URL),
                batch_size: env_parse("BATCH_SIZE", DEFAULT_BATCH_SIZE),
                sleep_interval_secs: env_parse("SLEEP_INTERVAL_SECONDS", DEFAULT_SLEEP_INTERVAL_SECS),
                http_timeout_secs: env_parse("HTTP_TIMEOUT_SECONDS", DEFAULT_HTTP_TIMEOUT_SECS),
                fetch_max_attempts: env_parse("FETCH_MAX_ATTEMPTS", DEFAULT_FETCH_MAX_ATTEMPTS),
                fetch_backoff_secs: env_parse("FETCH_BACKOFF_SECONDS", DEFAULT_FETCH_BACKOFF_SECS),
                state_file: PathBuf::from(env_or("STATE_FILE_PATH", DEFAULT_STATE_FILE_PATH)),
            },
            paths: PathsConfig {
                raw_dir: PathBuf::from(env_or("RAW_DIR", DEFAULT_RAW_DIR)),
                processed_dir: PathBuf::from(env_or("PROCESSED_DIR", DEFAULT_PROCESSED_DIR)),
                dlq_dir: PathBuf::from(env_or("DLQ_DIR", DEFAULT_DLQ_DIR)),
                lookup_file: PathBuf::from(env_or("LOOKUP_FILE", DEFAULT_LOOKUP_FILE)),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            },
            remote: RemoteConfig {
                host: env_or("REMOTE_HOST", DEFAULT_REMOTE_HOST),
                port: env_parse("REMOTE_PORT", DEFAULT_REMOTE_PORT),
                username: env_or("REMOTE_USER", DEFAULT_REMOTE_USER),
                password: env_or("REMOTE_PASSWORD", ""),
                remote_dir: env_or("REMOTE_DIR", DEFAULT_REMOTE_DIR),
                max_attempts: env_parse("UPLOAD_MAX_ATTEMPTS", DEFAULT_UPLOAD_MAX_ATTEMPTS),
                backoff_secs: env_parse("UPLOAD_BACKOFF_SECONDS", DEFAULT_UPLOAD_BACKOFF_SECS),
                connect_timeout_secs: env_parse(
                    "REMOTE_CONNECT_TIMEOUT_SECONDS",
                    DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS,
                ),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.extract.api_base_url.trim().is_empty() {
            anyhow::bail!("API base URL cannot be empty");
        }

        if self.extract.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.extract.sleep_interval_secs == 0 {
            anyhow::bail!("Sleep interval must be greater than 0 seconds");
        }

        if self.extract.fetch_max_attempts == 0 || self.remote.max_attempts == 0 {
            anyhow::bail!("Retry attempt counts must be greater than 0");
        }

        if self.database.url.trim().is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.remote.port == 0 {
            anyhow::bail!("Remote port must be greater than 0");
        }

        if self.remote.connect_timeout_secs == 0 {
            anyhow::bail!("Remote connect timeout must be greater than 0 seconds");
        }

        if self.remote.password.is_empty() {
            tracing::warn!("REMOTE_PASSWORD is empty - remote uploads will likely be rejected");
        }

        Ok(())
    }
}

impl ExtractConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Exponential policy: 5s, 15s, 45s, ...
    pub fn fetch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.fetch_max_attempts,
            Duration::from_secs(self.fetch_backoff_secs),
            3,
        )
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, Duration::from_secs(self.backoff_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extract: ExtractConfig {
                api_base_url: DEFAULT_API_BASE_URL.to_string(),
                batch_size: DEFAULT_BATCH_SIZE,
                sleep_interval_secs: DEFAULT_SLEEP_INTERVAL_SECS,
                http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
                fetch_max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
                fetch_backoff_secs: DEFAULT_FETCH_BACKOFF_SECS,
                state_file: PathBuf::from(DEFAULT_STATE_FILE_PATH),
            },
            paths: PathsConfig {
                raw_dir: PathBuf::from(DEFAULT_RAW_DIR),
                processed_dir: PathBuf::from(DEFAULT_PROCESSED_DIR),
                dlq_dir: PathBuf::from(DEFAULT_DLQ_DIR),
                lookup_file: PathBuf::from(DEFAULT_LOOKUP_FILE),
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
            },
            remote: RemoteConfig {
                host: DEFAULT_REMOTE_HOST.to_string(),
                port: DEFAULT_REMOTE_PORT,
                username: DEFAULT_REMOTE_USER.to_string(),
                password: String::new(),
                remote_dir: DEFAULT_REMOTE_DIR.to_string(),
                max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
                backoff_secs: DEFAULT_UPLOAD_BACKOFF_SECS,
                connect_timeout_secs: DEFAULT_REMOTE_CONNECT_TIMEOUT_SECS,
            },
        }
    }
}
