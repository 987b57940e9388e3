//! Brute-force protection and session security decisions.
//!
//! [`SecurityGuard`] keeps failure counters per IP address and per login in
//! memory. Counters are process-local; [`SecurityGuard::replay_failures`]
//! rebuilds them from the audit trail after a restart.

pub mod hijack;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::settings::SessionPolicy;
use crate::store::Session;

pub use hijack::{HijackAssessment, HijackIndicator, UserAgentFamily};

/// Default cap on tracked keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttemptKey {
    Ip(String),
    Login(String),
}

impl AttemptKey {
    /// Logins are case-insensitive so `Admin` and `admin` share a counter.
    pub fn login(login: &str) -> Self {
        AttemptKey::Login(login.trim().to_lowercase())
    }

    pub fn ip(ip: &str) -> Self {
        AttemptKey::Ip(ip.trim().to_string())
    }

    /// `ip:..,user:..` label used in audit details.
    pub fn pair_label(ip: Option<&str>, login: Option<&str>) -> String {
        Self::pair(ip, login)
            .map(|key| key.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn pair(ip: Option<&str>, login: Option<&str>) -> impl Iterator<Item = AttemptKey> {
        let ip = ip.filter(|s| !s.trim().is_empty()).map(AttemptKey::ip);
        let login = login.filter(|s| !s.trim().is_empty()).map(AttemptKey::login);
        ip.into_iter().chain(login)
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptKey::Ip(ip) => write!(f, "ip:{ip}"),
            AttemptKey::Login(login) => write!(f, "user:{login}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttemptCounter {
    pub count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_failure: DateTime<Utc>,
}

impl FailedAttemptCounter {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// A lock that ran out, or a quiet window with no lock at all.
    fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.locked_until {
            Some(until) => until <= now,
            None => now - self.last_failure > window,
        }
    }
}

/// What a recorded failure did to the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Keys that went from unlocked to locked with this failure
    pub newly_locked: Vec<AttemptKey>,
    /// Failure count per key after this failure
    pub counts: Vec<(AttemptKey, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardMetrics {
    pub tracked_keys: usize,
    pub locked_ips: usize,
    pub locked_logins: usize,
}

/// In-memory brute-force counters plus the stateless session checks.
#[derive(Debug)]
pub struct SecurityGuard {
    attempts: Mutex<HashMap<AttemptKey, FailedAttemptCounter>>,
    max_keys: usize,
}

impl Default for SecurityGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_KEYS)
    }
}

impl SecurityGuard {
    pub fn new(max_keys: usize) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_keys: max_keys.max(1),
        }
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<AttemptKey, FailedAttemptCounter>> {
        self.attempts.lock().unwrap_or_else(|poisoned| {
            tracing::error!(target: "tessera::security", "attempt counters were poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// `true` when neither the IP nor the login is locked out.
    ///
    /// Counters whose lock has elapsed are reset as a side effect.
    pub fn check_brute_force(
        &self,
        ip: Option<&str>,
        login: Option<&str>,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
    ) -> bool {
        self.locked_until(ip, login, now, policy).is_none()
    }

    /// Latest lock expiry among the given keys, if any is locked.
    pub fn locked_until(
        &self,
        ip: Option<&str>,
        login: Option<&str>,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
    ) -> Option<DateTime<Utc>> {
        let window = Duration::seconds(policy.lockout_duration_secs);
        let mut attempts = self.attempts();
        let mut until = None;
        for key in AttemptKey::pair(ip, login) {
            let Some(counter) = attempts.get(&key) else {
                continue;
            };
            if counter.is_locked(now) {
                until = until.max(counter.locked_until);
            } else if counter.is_stale(now, window) {
                attempts.remove(&key);
            }
        }
        until
    }

    /// Count a failure against the IP and the login.
    ///
    /// Once a key reaches `max_failed_attempts`, every further failure pushes
    /// its lock out to `now + lockout_duration`.
    pub fn record_failure(
        &self,
        ip: Option<&str>,
        login: Option<&str>,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
    ) -> FailureOutcome {
        let window = Duration::seconds(policy.lockout_duration_secs);
        let mut attempts = self.attempts();
        let mut outcome = FailureOutcome::default();

        for key in AttemptKey::pair(ip, login) {
            if !attempts.contains_key(&key) && attempts.len() >= self.max_keys {
                evict_one(&mut attempts, self.max_keys, now, window);
            }

            let counter = attempts.entry(key.clone()).or_insert(FailedAttemptCounter {
                count: 0,
                locked_until: None,
                last_failure: now,
            });
            if counter.is_stale(now, window) {
                counter.count = 0;
                counter.locked_until = None;
            }

            let was_locked = counter.is_locked(now);
            counter.count = counter.count.saturating_add(1);
            counter.last_failure = now;
            if counter.count >= policy.max_failed_attempts {
                counter.locked_until = Some(now + window);
                if !was_locked {
                    tracing::warn!(key = %key, failures = counter.count, "lockout engaged");
                    outcome.newly_locked.push(key.clone());
                }
            }
            outcome.counts.push((key, counter.count));
        }

        outcome
    }

    /// Forget failures after a successful login.
    pub fn reset_failures(&self, ip: Option<&str>, login: Option<&str>) {
        let mut attempts = self.attempts();
        for key in AttemptKey::pair(ip, login) {
            attempts.remove(&key);
        }
    }

    /// Drop counters that no longer influence any decision. Returns how many went.
    pub fn purge_stale(&self, now: DateTime<Utc>, policy: &SessionPolicy) -> usize {
        let window = Duration::seconds(policy.lockout_duration_secs);
        let mut attempts = self.attempts();
        let before = attempts.len();
        attempts.retain(|_, counter| !counter.is_stale(now, window));
        before - attempts.len()
    }

    /// Rebuild counters from historical failures `(ip, login, at)`.
    ///
    /// Failures are applied oldest first, each at its own timestamp, so locks
    /// end up exactly where live traffic would have left them.
    pub fn replay_failures<I>(&self, failures: I, now: DateTime<Utc>, policy: &SessionPolicy) -> usize
    where
        I: IntoIterator<Item = (Option<String>, Option<String>, DateTime<Utc>)>,
    {
        let horizon = now - Duration::seconds(policy.lockout_duration_secs);
        let mut failures: Vec<_> = failures
            .into_iter()
            .filter(|(_, _, at)| *at > horizon && *at <= now)
            .collect();
        failures.sort_by_key(|(_, _, at)| *at);

        for (ip, login, at) in &failures {
            self.record_failure(ip.as_deref(), login.as_deref(), *at, policy);
        }
        failures.len()
    }

    /// Snapshot of one counter, mostly for tests and diagnostics.
    pub fn counter(&self, key: &AttemptKey) -> Option<FailedAttemptCounter> {
        self.attempts().get(key).cloned()
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> GuardMetrics {
        let attempts = self.attempts();
        let mut metrics = GuardMetrics {
            tracked_keys: attempts.len(),
            ..Default::default()
        };
        for (key, counter) in attempts.iter() {
            if counter.is_locked(now) {
                match key {
                    AttemptKey::Ip(_) => metrics.locked_ips += 1,
                    AttemptKey::Login(_) => metrics.locked_logins += 1,
                }
            }
        }
        metrics
    }

    pub fn detect_hijack(
        &self,
        session: &Session,
        ip: Option<&str>,
        user_agent: Option<&str>,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
    ) -> HijackAssessment {
        hijack::assess(session, ip, user_agent, now, policy)
    }

    /// Whether a token issued at `token_issued_at` (unix seconds) should be replaced.
    pub fn rotation_due(&self, token_issued_at: i64, now: DateTime<Utc>, policy: &SessionPolicy) -> bool {
        policy.rotation_enabled
            && now.timestamp().saturating_sub(token_issued_at) >= policy.rotation_interval_secs
    }
}

/// Make room for one key: stale counters first, then the oldest unlocked
/// counter, and only when everything is locked, the oldest lock.
fn evict_one(
    attempts: &mut HashMap<AttemptKey, FailedAttemptCounter>,
    max_keys: usize,
    now: DateTime<Utc>,
    window: Duration,
) {
    attempts.retain(|_, counter| !counter.is_stale(now, window));
    if attempts.len() < max_keys {
        return;
    }

    let victim = attempts
        .iter()
        .filter(|(_, c)| !c.is_locked(now))
        .min_by_key(|(_, c)| c.last_failure)
        .or_else(|| attempts.iter().min_by_key(|(_, c)| c.last_failure))
        .map(|(key, _)| key.clone());

    if let Some(key) = victim {
        tracing::warn!(key = %key, "attempt tracker full, evicting counter");
        attempts.remove(&key);
    }
}
