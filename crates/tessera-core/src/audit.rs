//! Append-only audit trail of login and session events.
//!
//! Every state transition in [`SessionService`](crate::service::SessionService)
//! writes one row to `login_logs`. The `detail` column carries a versioned,
//! tagged JSON payload so downstream tooling can parse it without guessing.
//! The read side (history, security report, suspicious activity) aggregates
//! in Rust over a bounded time window.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};

use crate::error::TesseraError;
use crate::models::login_log::{self, Entity as LoginLog};
use crate::security::HijackIndicator;

/// Failures at or above this count flag an IP or login as brute forcing.
pub const BRUTE_FORCE_THRESHOLD: u64 = 5;
/// Successful logins from this many distinct IPs flag a user.
pub const MULTIPLE_LOCATIONS_THRESHOLD: usize = 3;
/// Logins with more failures than this appear in the security report.
pub const REPEATED_FAILURE_THRESHOLD: u64 = 3;
const TOP_FAILING_IPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSuccess,
    LoginFailed,
    LogoutManual,
    LogoutAuto,
    SessionCreated,
    SessionCreateFailed,
    SessionValidated,
    SessionExpired,
    SessionRotated,
    SessionRevoked,
    SessionLimitEvicted,
    AllSessionsInvalidated,
    InvalidToken,
    IpChanged,
    HijackSuspected,
    HijackDetected,
    IpBlocked,
    AccountLocked,
}

impl AuditAction {
    pub const ALL: [AuditAction; 18] = [
        AuditAction::LoginSuccess,
        AuditAction::LoginFailed,
        AuditAction::LogoutManual,
        AuditAction::LogoutAuto,
        AuditAction::SessionCreated,
        AuditAction::SessionCreateFailed,
        AuditAction::SessionValidated,
        AuditAction::SessionExpired,
        AuditAction::SessionRotated,
        AuditAction::SessionRevoked,
        AuditAction::SessionLimitEvicted,
        AuditAction::AllSessionsInvalidated,
        AuditAction::InvalidToken,
        AuditAction::IpChanged,
        AuditAction::HijackSuspected,
        AuditAction::HijackDetected,
        AuditAction::IpBlocked,
        AuditAction::AccountLocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::LoginSuccess => "login_success",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::LogoutManual => "logout_manual",
            AuditAction::LogoutAuto => "logout_auto",
            AuditAction::SessionCreated => "session_created",
            AuditAction::SessionCreateFailed => "session_create_failed",
            AuditAction::SessionValidated => "session_validated",
            AuditAction::SessionExpired => "session_expired",
            AuditAction::SessionRotated => "session_rotated",
            AuditAction::SessionRevoked => "session_revoked",
            AuditAction::SessionLimitEvicted => "session_limit_evicted",
            AuditAction::AllSessionsInvalidated => "all_sessions_invalidated",
            AuditAction::InvalidToken => "invalid_token",
            AuditAction::IpChanged => "ip_changed",
            AuditAction::HijackSuspected => "hijack_suspected",
            AuditAction::HijackDetected => "hijack_detected",
            AuditAction::IpBlocked => "ip_blocked",
            AuditAction::AccountLocked => "account_locked",
        }
    }

    /// Default `success` flag for an entry with this action.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            AuditAction::LoginSuccess
                | AuditAction::LogoutManual
                | AuditAction::SessionCreated
                | AuditAction::SessionValidated
                | AuditAction::SessionRotated
        )
    }

    /// Actions worth a `warn!` in the process log as well.
    pub fn is_alert(self) -> bool {
        matches!(
            self,
            AuditAction::HijackSuspected
                | AuditAction::HijackDetected
                | AuditAction::IpBlocked
                | AuditAction::AccountLocked
        )
    }

    /// Each successful login produces exactly one `session_created`, so that
    /// is what reports count; `login_success` would count it twice.
    fn counts_as_login(self) -> bool {
        matches!(self, AuditAction::SessionCreated | AuditAction::LoginFailed)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| TesseraError::Internal(format!("unknown audit action '{s}'")))
    }
}

/// Structured payload of an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetail {
    SessionCreated {
        session_id: i32,
        remember_me: bool,
        expires_at: DateTime<Utc>,
    },
    SessionEvicted {
        session_id: i32,
        active_sessions: usize,
        limit: u32,
    },
    SessionExpired {
        session_id: i32,
        expired_at: DateTime<Utc>,
    },
    SessionRotated {
        session_id: i32,
        previous_token_hash: String,
        ip_rebound: bool,
    },
    SessionRevoked {
        session_id: i32,
    },
    SessionsRevoked {
        session_ids: Vec<i32>,
    },
    IpChanged {
        session_id: i32,
        previous_ip: Option<String>,
        invalidated: bool,
    },
    HijackDetected {
        session_id: i32,
        indicators: Vec<HijackIndicator>,
        revoked_sessions: usize,
    },
    Lockout {
        key: String,
        failures: u32,
        locked_until: Option<DateTime<Utc>>,
    },
    LoginFailed {
        failures: u32,
    },
}

/// Envelope stored in `login_logs.detail`: `{"v":1,"kind":...,...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedDetail {
    pub v: u32,
    #[serde(flatten)]
    pub detail: AuditDetail,
}

impl VersionedDetail {
    pub const CURRENT: u32 = 1;
}

/// One audit entry waiting to be written.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub at: DateTime<Utc>,
    pub user_id: Option<i32>,
    pub login: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub token_hash: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
    pub detail: Option<AuditDetail>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, at: DateTime<Utc>) -> Self {
        Self {
            action,
            at,
            user_id: None,
            login: String::new(),
            ip_address: None,
            user_agent: None,
            token_hash: None,
            success: action.is_success(),
            reason: None,
            detail: None,
        }
    }

    pub fn user(mut self, user_id: i32) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn login(mut self, login: &str) -> Self {
        self.login = login.trim().to_string();
        self
    }

    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self
    }

    pub fn user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    /// Digest of the token involved. Callers pass `token::hash_token(..)` or a stored hash.
    pub fn token_hash(mut self, token_hash: impl Into<String>) -> Self {
        self.token_hash = Some(token_hash.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn detail(mut self, detail: AuditDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    fn into_active_model(self) -> Result<login_log::ActiveModel, TesseraError> {
        let detail = self
            .detail
            .map(|detail| {
                serde_json::to_string(&VersionedDetail {
                    v: VersionedDetail::CURRENT,
                    detail,
                })
            })
            .transpose()
            .map_err(|e| TesseraError::Internal(format!("audit detail: {e}")))?;

        Ok(login_log::ActiveModel {
            user_id: Set(self.user_id),
            login: Set(self.login),
            action: Set(self.action.as_str().to_string()),
            ip_address: Set(self.ip_address),
            user_agent: Set(self.user_agent),
            session_token: Set(self.token_hash),
            success: Set(self.success),
            reason: Set(self.reason),
            detail: Set(detail),
            created_at: Set(self.at.naive_utc()),
            ..Default::default()
        })
    }

    fn trace(&self) {
        if self.action.is_alert() {
            tracing::warn!(
                target: "tessera::audit",
                action = %self.action,
                user_id = ?self.user_id,
                login = %self.login,
                ip = ?self.ip_address,
                reason = ?self.reason,
                "security event"
            );
        } else if self.action == AuditAction::SessionValidated {
            tracing::debug!(target: "tessera::audit", action = %self.action, user_id = ?self.user_id, "session event");
        } else {
            tracing::info!(
                target: "tessera::audit",
                action = %self.action,
                user_id = ?self.user_id,
                ip = ?self.ip_address,
                success = self.success,
                reason = ?self.reason,
                "session event"
            );
        }
    }
}

/// Filter for [`AuditLog::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub user_id: Option<i32>,
    pub login: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountedKey {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityReport {
    pub since: DateTime<Utc>,
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub unique_users: usize,
    pub unique_ips: usize,
    pub top_failing_ips: Vec<CountedKey>,
    pub repeated_failure_logins: Vec<CountedKey>,
    pub active_sessions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousKind {
    BruteForceIp,
    BruteForceLogin,
    MultipleLocations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousActivity {
    pub kind: SuspiciousKind,
    pub subject: String,
    pub count: u64,
    pub ip_addresses: Vec<String>,
}

type AttemptRow = (String, Option<i32>, String, Option<String>);
/// `(action, user_id, login, ip)` of one login attempt.
type Attempt = (AuditAction, Option<i32>, String, Option<String>);

/// Writer and reader for `login_logs`.
#[derive(Clone, Debug)]
pub struct AuditLog {
    db: DatabaseConnection,
}

impl AuditLog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: AuditEvent) -> Result<(), TesseraError> {
        event.trace();
        event.into_active_model()?.insert(&self.db).await?;
        Ok(())
    }

    /// Write several entries in one statement.
    pub async fn record_many(&self, events: Vec<AuditEvent>) -> Result<(), TesseraError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            event.trace();
            rows.push(event.into_active_model()?);
        }
        LoginLog::insert_many(rows).exec_without_returning(&self.db).await?;
        Ok(())
    }

    /// Entries matching `filter`, newest first.
    pub async fn history(&self, filter: HistoryFilter) -> Result<Vec<login_log::Model>, TesseraError> {
        let mut query = LoginLog::find();
        if let Some(user_id) = filter.user_id {
            query = query.filter(login_log::Column::UserId.eq(user_id));
        }
        if let Some(login) = filter.login {
            query = query.filter(login_log::Column::Login.eq(login));
        }
        if let Some(action) = filter.action {
            query = query.filter(login_log::Column::Action.eq(action.as_str()));
        }
        if let Some(since) = filter.since {
            query = query.filter(login_log::Column::CreatedAt.gte(since.naive_utc()));
        }

        Ok(query
            .order_by_desc(login_log::Column::CreatedAt)
            .order_by_desc(login_log::Column::Id)
            .limit(filter.limit.unwrap_or(100))
            .all(&self.db)
            .await?)
    }

    /// `login_failed` entries after `since` as `(ip, login, at)`, oldest first.
    pub async fn recent_failures(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Option<String>, Option<String>, DateTime<Utc>)>, TesseraError> {
        let rows: Vec<(Option<String>, String, NaiveDateTime)> = LoginLog::find()
            .select_only()
            .column(login_log::Column::IpAddress)
            .column(login_log::Column::Login)
            .column(login_log::Column::CreatedAt)
            .filter(login_log::Column::Action.eq(AuditAction::LoginFailed.as_str()))
            .filter(login_log::Column::CreatedAt.gt(since.naive_utc()))
            .order_by_asc(login_log::Column::CreatedAt)
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(ip, login, at)| (ip, Some(login).filter(|l| !l.is_empty()), at.and_utc()))
            .collect())
    }

    async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<Attempt>, TesseraError> {
        let actions = [AuditAction::SessionCreated, AuditAction::LoginFailed].map(AuditAction::as_str);

        let rows: Vec<AttemptRow> = LoginLog::find()
            .select_only()
            .column(login_log::Column::Action)
            .column(login_log::Column::UserId)
            .column(login_log::Column::Login)
            .column(login_log::Column::IpAddress)
            .filter(login_log::Column::Action.is_in(actions))
            .filter(login_log::Column::CreatedAt.gte(since.naive_utc()))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(action, user_id, login, ip)| {
                let action = action.parse::<AuditAction>().ok()?;
                action
                    .counts_as_login()
                    .then_some((action, user_id, login, ip))
            })
            .collect())
    }

    /// Login totals and failure hot spots since `since`.
    pub async fn security_report(
        &self,
        since: DateTime<Utc>,
        active_sessions: u64,
    ) -> Result<SecurityReport, TesseraError> {
        let attempts = self.attempts_since(since).await?;

        let mut successful = 0;
        let mut failed = 0;
        let mut users = HashSet::new();
        let mut ips = HashSet::new();
        let mut failures_by_ip: HashMap<String, u64> = HashMap::new();
        let mut failures_by_login: HashMap<String, u64> = HashMap::new();

        for (action, user_id, login, ip) in &attempts {
            if let Some(user_id) = user_id {
                users.insert(*user_id);
            }
            if let Some(ip) = ip {
                ips.insert(ip.clone());
            }
            if *action == AuditAction::LoginFailed {
                failed += 1;
                if let Some(ip) = ip {
                    *failures_by_ip.entry(ip.clone()).or_default() += 1;
                }
                if !login.is_empty() {
                    *failures_by_login.entry(login.clone()).or_default() += 1;
                }
            } else {
                successful += 1;
            }
        }

        let mut top_failing_ips = ranked(failures_by_ip);
        top_failing_ips.truncate(TOP_FAILING_IPS);
        let repeated_failure_logins = ranked(failures_by_login)
            .into_iter()
            .filter(|c| c.count > REPEATED_FAILURE_THRESHOLD)
            .collect();

        Ok(SecurityReport {
            since,
            total_attempts: attempts.len() as u64,
            successful,
            failed,
            unique_users: users.len(),
            unique_ips: ips.len(),
            top_failing_ips,
            repeated_failure_logins,
            active_sessions,
        })
    }

    /// Brute-force sources and users logging in from many places since `since`.
    pub async fn suspicious_activity(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SuspiciousActivity>, TesseraError> {
        let attempts = self.attempts_since(since).await?;

        let mut failures_by_ip: HashMap<String, (u64, HashSet<String>)> = HashMap::new();
        let mut failures_by_login: HashMap<String, (u64, HashSet<String>)> = HashMap::new();
        let mut success_ips_by_user: HashMap<i32, (u64, HashSet<String>)> = HashMap::new();

        for (action, user_id, login, ip) in attempts {
            if action == AuditAction::LoginFailed {
                if let Some(ip) = &ip {
                    failures_by_ip.entry(ip.clone()).or_default().0 += 1;
                }
                if !login.is_empty() {
                    let entry = failures_by_login.entry(login).or_default();
                    entry.0 += 1;
                    entry.1.extend(ip);
                }
            } else if let Some(user_id) = user_id {
                let entry = success_ips_by_user.entry(user_id).or_default();
                entry.0 += 1;
                entry.1.extend(ip);
            }
        }

        let mut findings = Vec::new();
        for (ip, (count, _)) in failures_by_ip {
            if count >= BRUTE_FORCE_THRESHOLD {
                findings.push(SuspiciousActivity {
                    kind: SuspiciousKind::BruteForceIp,
                    subject: ip.clone(),
                    count,
                    ip_addresses: vec![ip],
                });
            }
        }
        for (login, (count, ips)) in failures_by_login {
            if count >= BRUTE_FORCE_THRESHOLD {
                findings.push(SuspiciousActivity {
                    kind: SuspiciousKind::BruteForceLogin,
                    subject: login,
                    count,
                    ip_addresses: sorted(ips),
                });
            }
        }
        for (user_id, (count, ips)) in success_ips_by_user {
            if ips.len() >= MULTIPLE_LOCATIONS_THRESHOLD {
                findings.push(SuspiciousActivity {
                    kind: SuspiciousKind::MultipleLocations,
                    subject: format!("user:{user_id}"),
                    count,
                    ip_addresses: sorted(ips),
                });
            }
        }

        findings.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.subject.cmp(&b.subject)));
        Ok(findings)
    }

    /// Retention: delete entries created before `horizon`.
    pub async fn purge_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, TesseraError> {
        let res = LoginLog::delete_many()
            .filter(login_log::Column::CreatedAt.lt(horizon.naive_utc()))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }
}

fn ranked(counts: HashMap<String, u64>) -> Vec<CountedKey> {
    let mut ranked: Vec<CountedKey> = counts
        .into_iter()
        .map(|(key, count)| CountedKey { key, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    ranked
}

fn sorted(set: HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.into_iter().collect();
    v.sort();
    v
}
