//! Session policy and its cached view of the `session_policy` table.
//!
//! The table is seeded by the migration and edited by an administrative
//! collaborator through [`SettingsCache::update_setting`]. Readers always go
//! through the cache, which reloads at most once per refresh interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder, Set};
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::TesseraError;
use crate::models::session_setting::{self, Entity as SessionSetting};

/// Default reload interval: 5 minutes.
const DEFAULT_REFRESH: Duration = Duration::from_secs(300);

pub const DEFAULT_SESSION_TIMEOUT: &str = "default_session_timeout";
pub const REMEMBER_ME_TIMEOUT: &str = "remember_me_timeout";
pub const MAX_SESSIONS_PER_USER: &str = "max_sessions_per_user";
pub const SESSION_TOKEN_LENGTH: &str = "session_token_length";
pub const TRACK_IP_CHANGES: &str = "track_ip_changes";
pub const INVALIDATE_ON_IP_CHANGE: &str = "invalidate_on_ip_change";
pub const SESSION_ROTATION_ENABLED: &str = "session_rotation_enabled";
pub const SESSION_ROTATION_INTERVAL: &str = "session_rotation_interval";
pub const MAX_FAILED_ATTEMPTS: &str = "max_failed_attempts";
pub const LOCKOUT_DURATION: &str = "lockout_duration";
pub const MAX_TOKEN_LIFETIME: &str = "max_token_lifetime";
pub const HIJACK_INACTIVITY_THRESHOLD: &str = "hijack_inactivity_threshold";

/// `(key, default value, description)` rows seeded into `session_policy`.
pub const DEFAULT_SETTINGS: &[(&str, &str, &str)] = &[
    (DEFAULT_SESSION_TIMEOUT, "3600", "Session lifetime in seconds"),
    (REMEMBER_ME_TIMEOUT, "2592000", "Remember-me session lifetime in seconds"),
    (MAX_SESSIONS_PER_USER, "5", "Concurrent active sessions per user"),
    (SESSION_TOKEN_LENGTH, "48", "Random bytes per session token"),
    (TRACK_IP_CHANGES, "true", "Record IP changes on validation"),
    (INVALIDATE_ON_IP_CHANGE, "false", "Revoke a session when its IP changes"),
    (SESSION_ROTATION_ENABLED, "true", "Rotate session tokens periodically"),
    (SESSION_ROTATION_INTERVAL, "86400", "Seconds between token rotations"),
    (MAX_FAILED_ATTEMPTS, "5", "Failures before an IP or login is locked"),
    (LOCKOUT_DURATION, "900", "Lockout length in seconds"),
    (MAX_TOKEN_LIFETIME, "2592000", "Oldest token signature accepted, in seconds"),
    (HIJACK_INACTIVITY_THRESHOLD, "14400", "Idle seconds that count as a hijack indicator"),
];

/// Effective session policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub default_timeout_secs: i64,
    pub remember_me_timeout_secs: i64,
    pub max_sessions_per_user: u32,
    pub token_byte_length: usize,
    pub track_ip_changes: bool,
    pub invalidate_on_ip_change: bool,
    pub rotation_enabled: bool,
    pub rotation_interval_secs: i64,
    pub max_failed_attempts: u32,
    pub lockout_duration_secs: i64,
    pub max_token_lifetime_secs: i64,
    pub hijack_inactivity_threshold_secs: i64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            remember_me_timeout_secs: 2_592_000,
            max_sessions_per_user: 5,
            token_byte_length: 48,
            track_ip_changes: true,
            invalidate_on_ip_change: false,
            rotation_enabled: true,
            rotation_interval_secs: 86_400,
            max_failed_attempts: 5,
            lockout_duration_secs: 900,
            max_token_lifetime_secs: 2_592_000,
            hijack_inactivity_threshold_secs: 14_400,
        }
    }
}

impl SessionPolicy {
    /// Build a policy from raw key/value rows.
    ///
    /// Missing keys keep their default. Unparseable values keep their default
    /// and are logged; a bad row never takes the service down.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let mut policy = Self::default();
        for (key, value) in settings {
            if let Err(reason) = policy.apply(key, value) {
                tracing::warn!(key = %key, value = %value, %reason, "ignoring session setting");
            }
        }
        policy
    }

    /// Apply one setting in place.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match key {
            DEFAULT_SESSION_TIMEOUT => self.default_timeout_secs = positive(value)?,
            REMEMBER_ME_TIMEOUT => self.remember_me_timeout_secs = positive(value)?,
            MAX_SESSIONS_PER_USER => {
                self.max_sessions_per_user = positive(value)?.try_into().map_err(|_| "too large")?
            }
            SESSION_TOKEN_LENGTH => {
                let len: usize = positive(value)?.try_into().map_err(|_| "too large")?;
                self.token_byte_length = len.clamp(16, 256);
            }
            TRACK_IP_CHANGES => self.track_ip_changes = flag(value)?,
            INVALIDATE_ON_IP_CHANGE => self.invalidate_on_ip_change = flag(value)?,
            SESSION_ROTATION_ENABLED => self.rotation_enabled = flag(value)?,
            SESSION_ROTATION_INTERVAL => self.rotation_interval_secs = positive(value)?,
            MAX_FAILED_ATTEMPTS => {
                self.max_failed_attempts = positive(value)?.try_into().map_err(|_| "too large")?
            }
            LOCKOUT_DURATION => self.lockout_duration_secs = positive(value)?,
            MAX_TOKEN_LIFETIME => self.max_token_lifetime_secs = positive(value)?,
            HIJACK_INACTIVITY_THRESHOLD => self.hijack_inactivity_threshold_secs = positive(value)?,
            _ => return Err("unknown setting".to_string()),
        }
        Ok(())
    }

    /// Lifetime of a new session.
    pub fn timeout_for(&self, remember_me: bool) -> chrono::Duration {
        let secs = if remember_me {
            self.remember_me_timeout_secs
        } else {
            self.default_timeout_secs
        };
        chrono::Duration::seconds(secs)
    }
}

fn positive(value: &str) -> Result<i64, String> {
    match value.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err("must be positive".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn flag(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}

struct Cached {
    policy: SessionPolicy,
    loaded_at: Option<Instant>,
}

/// Read-through cache over the `session_policy` table.
pub struct SettingsCache {
    db: DatabaseConnection,
    state: RwLock<Cached>,
    refresh: Duration,
    clock: Arc<dyn Clock>,
}

impl SettingsCache {
    /// Create a cache with the default refresh interval (5 minutes).
    pub fn new(db: DatabaseConnection) -> Self {
        Self::with_refresh(db, DEFAULT_REFRESH)
    }

    pub fn with_refresh(db: DatabaseConnection, refresh: Duration) -> Self {
        Self {
            db,
            state: RwLock::new(Cached {
                policy: SessionPolicy::default(),
                loaded_at: None,
            }),
            refresh,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp `updated_at` from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current policy, reloading from the table when the cached copy is stale.
    ///
    /// A failed reload keeps serving the last known policy.
    pub async fn policy(&self) -> SessionPolicy {
        {
            let state = self.state.read().await;
            if let Some(loaded_at) = state.loaded_at {
                if loaded_at.elapsed() < self.refresh {
                    return state.policy;
                }
            }
        }

        match self.refresh().await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(error = %e, "session policy reload failed, using cached policy");
                let mut state = self.state.write().await;
                // Back off until the next interval instead of hammering the store.
                state.loaded_at = Some(Instant::now());
                state.policy
            }
        }
    }

    /// Force a reload from the table.
    pub async fn refresh(&self) -> Result<SessionPolicy, TesseraError> {
        let rows = self.rows().await?;
        let settings: HashMap<String, String> =
            rows.into_iter().map(|row| (row.key, row.value)).collect();
        let policy = SessionPolicy::from_settings(&settings);

        let mut state = self.state.write().await;
        state.policy = policy;
        state.loaded_at = Some(Instant::now());
        tracing::debug!(?policy, "session policy loaded");
        Ok(policy)
    }

    /// Raw rows, ordered by key.
    pub async fn rows(&self) -> Result<Vec<session_setting::Model>, TesseraError> {
        Ok(SessionSetting::find()
            .order_by_asc(session_setting::Column::Key)
            .all(&self.db)
            .await?)
    }

    /// Validate and persist one setting, then reload.
    pub async fn update_setting(&self, key: &str, value: &str) -> Result<SessionPolicy, TesseraError> {
        let mut candidate = SessionPolicy::default();
        candidate
            .apply(key, value)
            .map_err(|reason| TesseraError::Config(format!("{key}: {reason}")))?;

        let description = DEFAULT_SETTINGS
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|(_, _, d)| d.to_string());

        let row = session_setting::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.trim().to_string()),
            description: Set(description),
            updated_at: Set(self.clock.now().naive_utc()),
        };
        SessionSetting::insert(row)
            .on_conflict(
                OnConflict::column(session_setting::Column::Key)
                    .update_columns([
                        session_setting::Column::Value,
                        session_setting::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        tracing::info!(key = %key, value = %value, "session setting updated");
        self.refresh().await
    }
}
