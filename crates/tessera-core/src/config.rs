use serde::Deserialize;

use crate::error::TesseraError;

const DEV_TOKEN_SECRET: &str = "tessera-dev-secret-change-me";

/// Process configuration loaded from environment variables.
///
/// Session *policy* (timeouts, limits, lockout thresholds) is not configured
/// here: it lives in the `session_policy` table and is read through
/// [`SettingsCache`](crate::settings::SettingsCache).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database connection URL (e.g. sqlite://tessera.db?mode=rwc, postgres://...)
    pub database_url: String,

    /// HMAC key used to sign session tokens
    pub token_secret: String,

    /// Environment: development, production, test
    pub environment: String,

    /// Seconds between policy reloads (default: 300)
    pub settings_refresh_secs: u64,

    /// Seconds between maintenance sweeps (default: 300)
    pub cleanup_interval_secs: u64,

    /// Rows deactivated per sweep batch (default: 500)
    pub cleanup_batch_size: u64,

    /// Upper bound on tracked brute-force keys (default: 10000)
    pub max_tracked_attempt_keys: usize,

    /// Purge inactive session rows older than this many days (default: keep forever)
    pub session_retention_days: Option<i64>,

    /// Purge login log entries older than this many days (default: 90)
    pub log_retention_days: Option<i64>,

    /// Pool size for non-memory databases (default: 20)
    pub max_db_connections: u32,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    ///
    /// Production refuses to start without an explicit `SESSION_TOKEN_SECRET`.
    pub fn from_env() -> Result<Self, TesseraError> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let environment =
            std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let token_secret = match std::env::var("SESSION_TOKEN_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if environment == "production" => {
                return Err(TesseraError::Config(
                    "SESSION_TOKEN_SECRET must be set in production".to_string(),
                ));
            }
            _ => DEV_TOKEN_SECRET.to_string(),
        };

        Ok(Config {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://tessera.db?mode=rwc".to_string()),
            token_secret,
            environment,
            settings_refresh_secs: env_or("SETTINGS_REFRESH_SECS", 300),
            cleanup_interval_secs: env_or("CLEANUP_INTERVAL_SECS", 300),
            cleanup_batch_size: env_or("CLEANUP_BATCH_SIZE", 500),
            max_tracked_attempt_keys: env_or("MAX_TRACKED_ATTEMPT_KEYS", 10_000),
            session_retention_days: optional_days("SESSION_RETENTION_DAYS", None),
            log_retention_days: optional_days("LOG_RETENTION_DAYS", Some(90)),
            max_db_connections: env_or("DB_MAX_CONNECTIONS", 20),
        })
    }

    /// Configuration for tests and embedded use: in-memory SQLite, fixed secret.
    pub fn in_memory() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            token_secret: "tessera-test-secret".to_string(),
            environment: "test".to_string(),
            settings_refresh_secs: 300,
            cleanup_interval_secs: 300,
            cleanup_batch_size: 500,
            max_tracked_attempt_keys: 10_000,
            session_retention_days: None,
            log_retention_days: Some(90),
            max_db_connections: 1,
        }
    }

    /// Check if running in development mode.
    pub fn is_dev(&self) -> bool {
        self.environment == "development"
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `0`, `off` or `never` disable a retention horizon.
fn optional_days(key: &str, default: Option<i64>) -> Option<i64> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" | "0" | "off" | "never" => None,
            value => value.parse().ok().filter(|d: &i64| *d > 0).or(default),
        },
        Err(_) => default,
    }
}
