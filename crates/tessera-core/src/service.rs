//! Session lifecycle orchestration.
//!
//! [`SessionService`] is the only component that changes session state. Each
//! session moves `Active -> {Rotated (still active), Expired, Revoked}`; the
//! two terminal states both map to `is_active = false` and differ only in the
//! audit trail. Every transition writes an audit entry.
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = SessionService::new(db, &config)?;
//!
//! // after the authenticator has verified a password:
//! let issued = service.create_session(user.id, remember_me, ip, ua).await?;
//!
//! // on every protected request:
//! match service.validate_session(&token, ip, ua).await? {
//!     Some(v) if v.rotated => { /* hand v.token back to the client */ }
//!     Some(v) => { /* proceed as v.session.user_id */ }
//!     None => { /* not authenticated */ }
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{
    AuditAction, AuditDetail, AuditEvent, AuditLog, SecurityReport, SuspiciousActivity,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::TesseraError;
use crate::locks::KeyedLocks;
use crate::security::{AttemptKey, FailureOutcome, SecurityGuard, hijack};
use crate::settings::{SessionPolicy, SettingsCache};
use crate::store::{DbSessionStore, NewSession, Session, SessionStatistics, SessionStore};
use crate::token::{self, TokenSigner, hash_token};

/// Mint attempts before a token collision is reported as a store fault.
const TOKEN_MINT_ATTEMPTS: usize = 3;

/// A freshly created session and the only copy of its raw token.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub token: String,
}

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub session: Session,
    /// The token the client must present next time
    pub token: String,
    /// `true` when `token` differs from the one presented
    pub rotated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Not due; keep using the presented token.
    Unchanged,
    /// Replaced; the new token is attached.
    Rotated(String),
    /// Another request rotated or revoked the session first.
    Superseded,
}

/// Why a session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    /// The user logged out.
    Logout,
    /// The client logged out on its own, e.g. an idle timer.
    AutoLogout,
    /// An administrator ended the session.
    Admin,
    PasswordChanged,
    SecurityIncident,
}

impl RevokeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevokeReason::Logout => "logout",
            RevokeReason::AutoLogout => "auto_logout",
            RevokeReason::Admin => "admin",
            RevokeReason::PasswordChanged => "password_changed",
            RevokeReason::SecurityIncident => "security_incident",
        }
    }

    fn action(self) -> AuditAction {
        match self {
            RevokeReason::Logout => AuditAction::LogoutManual,
            RevokeReason::AutoLogout => AuditAction::LogoutAuto,
            _ => AuditAction::SessionRevoked,
        }
    }
}

impl std::str::FromStr for RevokeReason {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(RevokeReason::Logout),
            "auto_logout" => Ok(RevokeReason::AutoLogout),
            "admin" => Ok(RevokeReason::Admin),
            "password_changed" => Ok(RevokeReason::PasswordChanged),
            "security_incident" => Ok(RevokeReason::SecurityIncident),
            other => Err(TesseraError::Config(format!("unknown revoke reason '{other}'"))),
        }
    }
}

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub sessions: u64,
    pub log_entries: u64,
}

/// Session issuance, validation, rotation and revocation.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    signer: TokenSigner,
    settings: Arc<SettingsCache>,
    guard: Arc<SecurityGuard>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    user_locks: KeyedLocks<i32>,
    sweep_batch_size: u64,
    session_retention: Option<Duration>,
    log_retention: Option<Duration>,
}

impl SessionService {
    /// Build a service over `db` using the wall clock.
    pub fn new(db: DatabaseConnection, config: &Config) -> Result<Self, TesseraError> {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: DatabaseConnection,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TesseraError> {
        Ok(Self {
            store: Arc::new(DbSessionStore::new(db.clone())),
            signer: TokenSigner::new(config.token_secret.as_bytes())?,
            settings: Arc::new(
                SettingsCache::with_refresh(
                    db.clone(),
                    std::time::Duration::from_secs(config.settings_refresh_secs),
                )
                .with_clock(Arc::clone(&clock)),
            ),
            guard: Arc::new(SecurityGuard::new(config.max_tracked_attempt_keys)),
            audit: AuditLog::new(db),
            clock,
            user_locks: KeyedLocks::new(),
            sweep_batch_size: config.cleanup_batch_size.max(1),
            session_retention: config.session_retention_days.map(Duration::days),
            log_retention: config.log_retention_days.map(Duration::days),
        })
    }

    /// Swap in a different store, e.g. one shared with another service.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn settings(&self) -> &SettingsCache {
        &self.settings
    }

    pub fn guard(&self) -> &SecurityGuard {
        &self.guard
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// CSRF token for forms submitted under `session_token`.
    pub fn csrf_token(&self, session_token: &str) -> String {
        self.signer.csrf_token(session_token, self.clock.now().timestamp())
    }

    /// Check a submitted CSRF token against the caller's session token.
    pub fn verify_csrf(&self, csrf: &str, session_token: &str) -> bool {
        self.signer.verify_csrf(
            csrf,
            session_token,
            self.clock.now().timestamp(),
            token::CSRF_MAX_AGE_SECS,
        )
    }

    // ── Issuance ──

    /// Open a session for an already authenticated user.
    ///
    /// Fails with [`TesseraError::Security`] while the client IP is locked
    /// out. When the user is at the session limit, the least recently used
    /// sessions are ended first. The returned token is never stored.
    pub async fn create_session(
        &self,
        user_id: i32,
        remember_me: bool,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<IssuedSession, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;

        if let Some(until) = self.guard.locked_until(ip, None, now, &policy) {
            self.audit
                .record(
                    AuditEvent::new(AuditAction::IpBlocked, now)
                        .user(user_id)
                        .ip(ip)
                        .user_agent(user_agent)
                        .reason("session creation refused during lockout")
                        .detail(AuditDetail::Lockout {
                            key: ip.map(|ip| AttemptKey::ip(ip).to_string()).unwrap_or_default(),
                            failures: policy.max_failed_attempts,
                            locked_until: Some(until),
                        }),
                )
                .await?;
            return Err(TesseraError::Security(
                "Too many failed attempts, try again later".to_string(),
            ));
        }

        let _user_lock = self.user_locks.lock(user_id).await;
        self.evict_over_limit(user_id, &policy, now, 1).await?;

        let expires_at = now + policy.timeout_for(remember_me);
        let mut collisions = 0;
        let (session, token) = loop {
            let token = self
                .signer
                .new_token(user_id, ip, policy.token_byte_length, now.timestamp());
            let new = NewSession {
                user_id,
                token: token.clone(),
                created_at: now,
                expires_at,
                remember_me,
                ip_address: ip.map(str::to_string),
                user_agent: user_agent.map(str::to_string),
            };
            match self.store.insert(new).await {
                Ok(session) => break (session, token),
                Err(TesseraError::DuplicateToken) if collisions + 1 < TOKEN_MINT_ATTEMPTS => {
                    collisions += 1;
                    tracing::warn!(user_id, collisions, "session token collision, reminting");
                }
                Err(TesseraError::DuplicateToken) => {
                    self.audit
                        .record(
                            AuditEvent::new(AuditAction::SessionCreateFailed, now)
                                .user(user_id)
                                .ip(ip)
                                .user_agent(user_agent)
                                .reason("token collision"),
                        )
                        .await?;
                    return Err(TesseraError::Store(DbErr::Custom(format!(
                        "session token collided {TOKEN_MINT_ATTEMPTS} times"
                    ))));
                }
                Err(e) => return Err(e),
            }
        };

        self.guard.reset_failures(ip, None);
        self.audit
            .record(
                AuditEvent::new(AuditAction::SessionCreated, now)
                    .user(user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .token_hash(session.token_hash.clone())
                    .detail(AuditDetail::SessionCreated {
                        session_id: session.id,
                        remember_me,
                        expires_at,
                    }),
            )
            .await?;

        tracing::info!(user_id, session_id = session.id, remember_me, "session created");
        Ok(IssuedSession { session, token })
    }

    // ── Validation ──

    /// Check a presented token.
    ///
    /// `None` covers every denial (unknown, forged, expired, revoked,
    /// hijacked, locked out); the reason only appears in the audit trail.
    /// A `Some` may carry a replacement token that the caller must hand back
    /// to the client.
    pub async fn validate_session(
        &self,
        token: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<ValidatedSession>, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;

        if !self.guard.check_brute_force(ip, None, now, &policy) {
            self.audit
                .record(
                    AuditEvent::new(AuditAction::IpBlocked, now)
                        .ip(ip)
                        .user_agent(user_agent)
                        .reason("validation refused during lockout"),
                )
                .await?;
            return Ok(None);
        }

        if !token::is_well_formed(token) {
            self.record_invalid(now, None, ip, user_agent, "malformed token", false).await?;
            return Ok(None);
        }

        let Some(session) = self.store.get_active_by_token(token).await? else {
            self.record_invalid(now, None, ip, user_agent, "unknown token", false).await?;
            return Ok(None);
        };

        if session.is_expired(now) {
            self.expire(&session, now, ip, user_agent).await?;
            return Ok(None);
        }

        if !self.signer.verify(
            token,
            session.user_id,
            session.bound_ip.as_deref(),
            now.timestamp(),
            policy.max_token_lifetime_secs,
        ) {
            let deactivated = self.store.deactivate(session.id).await?;
            self.record_invalid(
                now,
                Some(&session),
                ip,
                user_agent,
                "signature check failed",
                deactivated,
            )
            .await?;
            return Ok(None);
        }

        let assessment = self.guard.detect_hijack(&session, ip, user_agent, now, &policy);
        if assessment.is_suspicious() {
            self.contain_hijack(&session, assessment.indicators, now, ip, user_agent)
                .await?;
            return Ok(None);
        }
        if !assessment.indicators.is_empty() {
            self.audit
                .record(
                    AuditEvent::new(AuditAction::HijackSuspected, now)
                        .user(session.user_id)
                        .ip(ip)
                        .user_agent(user_agent)
                        .token_hash(session.token_hash.clone())
                        .success(true)
                        .reason("single hijack indicator")
                        .detail(AuditDetail::HijackDetected {
                            session_id: session.id,
                            indicators: assessment.indicators,
                            revoked_sessions: 0,
                        }),
                )
                .await?;
        }

        let ip_changed = hijack::ip_changed(session.ip_address.as_deref(), ip);
        if ip_changed && policy.track_ip_changes {
            let invalidate = policy.invalidate_on_ip_change;
            if invalidate {
                self.store.deactivate(session.id).await?;
            }
            self.audit
                .record(
                    AuditEvent::new(AuditAction::IpChanged, now)
                        .user(session.user_id)
                        .ip(ip)
                        .user_agent(user_agent)
                        .token_hash(session.token_hash.clone())
                        .success(!invalidate)
                        .detail(AuditDetail::IpChanged {
                            session_id: session.id,
                            previous_ip: session.ip_address.clone(),
                            invalidated: invalidate,
                        }),
                )
                .await?;
            if invalidate {
                return Ok(None);
            }
        }

        // The token keeps its original binding until a scheduled rotation
        // signs the replacement for the address the client is using now.
        let due = token::issued_at(token)
            .is_some_and(|issued| self.guard.rotation_due(issued, now, &policy));

        let observed_ip = ip.or(session.ip_address.as_deref()).map(str::to_string);
        let mut session = session;
        let (current_token, rotated) = if due {
            let rebound = observed_ip != session.bound_ip;
            match self
                .rotate_token(&session, token, observed_ip.as_deref(), now, &policy, rebound)
                .await?
            {
                Rotation::Rotated(new_token) => {
                    session.token_hash = hash_token(&new_token);
                    session.bound_ip = observed_ip.clone();
                    session.ip_address = observed_ip;
                    (new_token, true)
                }
                Rotation::Superseded | Rotation::Unchanged => {
                    self.record_invalid(now, Some(&session), ip, user_agent, "superseded", false)
                        .await?;
                    return Ok(None);
                }
            }
        } else {
            if !self.store.touch_activity(session.id, now, ip).await? {
                self.record_invalid(now, Some(&session), ip, user_agent, "inactive", false)
                    .await?;
                return Ok(None);
            }
            session.ip_address = observed_ip;
            (token.to_string(), false)
        };
        session.last_activity_at = now;

        self.audit
            .record(
                AuditEvent::new(AuditAction::SessionValidated, now)
                    .user(session.user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .token_hash(session.token_hash.clone()),
            )
            .await?;

        Ok(Some(ValidatedSession {
            session,
            token: current_token,
            rotated,
        }))
    }

    /// Like [`validate_session`](Self::validate_session) but any denial is
    /// [`TesseraError::Authentication`].
    pub async fn authenticate(
        &self,
        token: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<ValidatedSession, TesseraError> {
        self.validate_session(token, ip, user_agent)
            .await?
            .ok_or(TesseraError::Authentication)
    }

    /// Rotate the token of `session` if the rotation interval has passed.
    /// The replacement is bound to the address the session was last seen from.
    pub async fn rotate_if_due(&self, session: &Session, token: &str) -> Result<Rotation, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;
        let due = token::issued_at(token)
            .is_some_and(|issued| self.guard.rotation_due(issued, now, &policy));
        if !due {
            return Ok(Rotation::Unchanged);
        }
        let rebound = session.ip_address != session.bound_ip;
        self.rotate_token(session, token, session.ip_address.as_deref(), now, &policy, rebound)
            .await
    }

    async fn rotate_token(
        &self,
        session: &Session,
        old_token: &str,
        bind_ip: Option<&str>,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
        ip_rebound: bool,
    ) -> Result<Rotation, TesseraError> {
        for _ in 0..TOKEN_MINT_ATTEMPTS {
            let new_token = self.signer.new_token(
                session.user_id,
                bind_ip,
                policy.token_byte_length,
                now.timestamp(),
            );
            match self
                .store
                .replace_token(session.id, old_token, &new_token, bind_ip, now)
                .await
            {
                Ok(true) => {
                    self.audit
                        .record(
                            AuditEvent::new(AuditAction::SessionRotated, now)
                                .user(session.user_id)
                                .ip(bind_ip)
                                .token_hash(hash_token(&new_token))
                                .detail(AuditDetail::SessionRotated {
                                    session_id: session.id,
                                    previous_token_hash: hash_token(old_token),
                                    ip_rebound,
                                }),
                        )
                        .await?;
                    tracing::debug!(session_id = session.id, ip_rebound, "session token rotated");
                    return Ok(Rotation::Rotated(new_token));
                }
                Ok(false) => {
                    tracing::debug!(session_id = session.id, "rotation lost to a concurrent request");
                    return Ok(Rotation::Superseded);
                }
                Err(TesseraError::DuplicateToken) => {
                    tracing::warn!(session_id = session.id, "rotated token collided, reminting");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TesseraError::Store(DbErr::Custom(format!(
            "rotated token collided {TOKEN_MINT_ATTEMPTS} times"
        ))))
    }

    async fn expire(
        &self,
        session: &Session,
        now: DateTime<Utc>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), TesseraError> {
        self.store.deactivate(session.id).await?;
        self.audit
            .record(
                AuditEvent::new(AuditAction::SessionExpired, now)
                    .user(session.user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .token_hash(session.token_hash.clone())
                    .reason("expired")
                    .detail(AuditDetail::SessionExpired {
                        session_id: session.id,
                        expired_at: session.expires_at,
                    }),
            )
            .await
    }

    async fn contain_hijack(
        &self,
        session: &Session,
        indicators: Vec<hijack::HijackIndicator>,
        now: DateTime<Utc>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), TesseraError> {
        let _user_lock = self.user_locks.lock(session.user_id).await;
        let this_one = usize::from(self.store.deactivate(session.id).await?);
        let others = self.store.deactivate_all_for_user(session.user_id).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::HijackDetected, now)
                    .user(session.user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .token_hash(session.token_hash.clone())
                    .reason("possible session hijacking")
                    .detail(AuditDetail::HijackDetected {
                        session_id: session.id,
                        indicators,
                        revoked_sessions: this_one + others.len(),
                    }),
            )
            .await?;
        tracing::warn!(
            user_id = session.user_id,
            session_id = session.id,
            revoked = this_one + others.len(),
            "hijack suspected, all sessions of user revoked"
        );
        Ok(())
    }

    async fn record_invalid(
        &self,
        now: DateTime<Utc>,
        session: Option<&Session>,
        ip: Option<&str>,
        user_agent: Option<&str>,
        reason: &str,
        deactivated: bool,
    ) -> Result<(), TesseraError> {
        let mut event = AuditEvent::new(AuditAction::InvalidToken, now)
            .ip(ip)
            .user_agent(user_agent)
            .reason(reason);
        if let Some(session) = session {
            event = event
                .user(session.user_id)
                .token_hash(session.token_hash.clone());
            if deactivated {
                event = event.detail(AuditDetail::SessionRevoked {
                    session_id: session.id,
                });
            }
        }
        self.audit.record(event).await
    }

    // ── Revocation ──

    /// End the session holding `token`. Idempotent: returns `true` only when
    /// this call ended it, and is audited either way.
    pub async fn invalidate_session(&self, token: &str, reason: RevokeReason) -> Result<bool, TesseraError> {
        let now = self.clock.now();
        let session = if token::is_well_formed(token) {
            self.store.get_active_by_token(token).await?
        } else {
            None
        };

        let mut event = AuditEvent::new(reason.action(), now)
            .token_hash(hash_token(token))
            .reason(reason.as_str());
        let ended = match &session {
            Some(session) => {
                let ended = self.store.deactivate(session.id).await?;
                event = event
                    .user(session.user_id)
                    .ip(session.ip_address.as_deref())
                    .detail(AuditDetail::SessionRevoked {
                        session_id: session.id,
                    });
                ended
            }
            None => false,
        };
        self.audit.record(event.success(ended)).await?;
        Ok(ended)
    }

    /// Administrative variant of [`invalidate_session`](Self::invalidate_session).
    pub async fn invalidate_session_by_id(&self, id: i32, reason: RevokeReason) -> Result<bool, TesseraError> {
        let now = self.clock.now();
        let session = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| TesseraError::RecordNotFound(format!("session {id}")))?;

        let ended = session.is_active && self.store.deactivate(session.id).await?;
        self.audit
            .record(
                AuditEvent::new(reason.action(), now)
                    .user(session.user_id)
                    .token_hash(session.token_hash.clone())
                    .reason(reason.as_str())
                    .success(ended)
                    .detail(AuditDetail::SessionRevoked {
                        session_id: session.id,
                    }),
            )
            .await?;
        Ok(ended)
    }

    /// End every active session of a user. Returns how many were ended.
    pub async fn invalidate_all_for_user(&self, user_id: i32, reason: RevokeReason) -> Result<usize, TesseraError> {
        let now = self.clock.now();
        let _user_lock = self.user_locks.lock(user_id).await;
        let ended = self.store.deactivate_all_for_user(user_id).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::AllSessionsInvalidated, now)
                    .user(user_id)
                    .reason(reason.as_str())
                    .success(true)
                    .detail(AuditDetail::SessionsRevoked {
                        session_ids: ended.clone(),
                    }),
            )
            .await?;
        tracing::info!(user_id, count = ended.len(), reason = reason.as_str(), "all sessions invalidated");
        Ok(ended.len())
    }

    // ── Per-user listing and limits ──

    /// Active, unexpired sessions of a user, most recently used first.
    pub async fn list_active_sessions(&self, user_id: i32) -> Result<Vec<Session>, TesseraError> {
        let mut sessions = self.store.list_active_by_user(user_id, self.clock.now()).await?;
        sessions.reverse();
        Ok(sessions)
    }

    /// Trim a user down to the session limit, e.g. after the limit was lowered.
    pub async fn enforce_session_limit(&self, user_id: i32) -> Result<usize, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;
        let _user_lock = self.user_locks.lock(user_id).await;
        self.evict_over_limit(user_id, &policy, now, 0).await
    }

    /// Caller holds the user's lock. Makes room for `incoming` new sessions.
    async fn evict_over_limit(
        &self,
        user_id: i32,
        policy: &SessionPolicy,
        now: DateTime<Utc>,
        incoming: usize,
    ) -> Result<usize, TesseraError> {
        let active = self.store.list_active_by_user(user_id, now).await?;
        let limit = policy.max_sessions_per_user as usize;
        let excess = (active.len() + incoming).saturating_sub(limit);
        if excess == 0 {
            return Ok(0);
        }

        let mut events = Vec::with_capacity(excess);
        for session in active.iter().take(excess) {
            if self.store.deactivate(session.id).await? {
                events.push(
                    AuditEvent::new(AuditAction::SessionLimitEvicted, now)
                        .user(user_id)
                        .ip(session.ip_address.as_deref())
                        .token_hash(session.token_hash.clone())
                        .reason("session limit reached")
                        .detail(AuditDetail::SessionEvicted {
                            session_id: session.id,
                            active_sessions: active.len(),
                            limit: policy.max_sessions_per_user,
                        }),
                );
            }
        }
        let evicted = events.len();
        self.audit.record_many(events).await?;
        tracing::info!(user_id, evicted, limit, "session limit enforced");
        Ok(evicted)
    }

    // ── Maintenance ──

    /// Deactivate every expired session. Returns how many were swept.
    pub async fn cleanup_expired(&self) -> Result<u64, TesseraError> {
        self.cleanup_expired_until(&CancellationToken::new()).await
    }

    /// Sweep in batches, stopping between batches once `cancel` fires.
    pub async fn cleanup_expired_until(&self, cancel: &CancellationToken) -> Result<u64, TesseraError> {
        let mut total = 0u64;
        while !cancel.is_cancelled() {
            let now = self.clock.now();
            let swept = self.store.sweep_expired(now, self.sweep_batch_size).await?;
            let batch = swept.len() as u64;

            let events = swept
                .into_iter()
                .map(|session| {
                    AuditEvent::new(AuditAction::SessionExpired, now)
                        .user(session.user_id)
                        .ip(session.ip_address.as_deref())
                        .token_hash(session.token_hash)
                        .reason("swept")
                        .detail(AuditDetail::SessionExpired {
                            session_id: session.id,
                            expired_at: session.expires_at,
                        })
                })
                .collect();
            self.audit.record_many(events).await?;

            total += batch;
            if batch < self.sweep_batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if total > 0 {
            tracing::info!(swept = total, "expired sessions cleaned up");
        }
        Ok(total)
    }

    /// Drop brute-force counters that no longer matter.
    pub async fn purge_stale_attempts(&self) -> usize {
        let policy = self.settings.policy().await;
        self.guard.purge_stale(self.clock.now(), &policy)
    }

    /// Apply the configured retention horizons.
    pub async fn purge_retained(&self) -> Result<RetentionOutcome, TesseraError> {
        let now = self.clock.now();
        let mut outcome = RetentionOutcome::default();
        if let Some(keep) = self.session_retention {
            outcome.sessions = self.store.purge_inactive_before(now - keep).await?;
        }
        if let Some(keep) = self.log_retention {
            outcome.log_entries = self.audit.purge_older_than(now - keep).await?;
        }
        if outcome != RetentionOutcome::default() {
            tracing::info!(
                sessions = outcome.sessions,
                log_entries = outcome.log_entries,
                "retention purge"
            );
        }
        Ok(outcome)
    }

    // ── Login attempts (called by the authenticator) ──

    /// `false` while the IP or the login is locked out.
    pub async fn check_login_allowed(&self, ip: Option<&str>, login: Option<&str>) -> Result<bool, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;
        let Some(until) = self.guard.locked_until(ip, login, now, &policy) else {
            return Ok(true);
        };

        self.audit
            .record(
                AuditEvent::new(AuditAction::IpBlocked, now)
                    .login(login.unwrap_or_default())
                    .ip(ip)
                    .reason("login attempt during lockout")
                    .detail(AuditDetail::Lockout {
                        key: AttemptKey::pair_label(ip, login),
                        failures: policy.max_failed_attempts,
                        locked_until: Some(until),
                    }),
            )
            .await?;
        Ok(false)
    }

    /// Count a failed password check and audit any lockout it triggers.
    pub async fn record_login_failure(
        &self,
        login: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        reason: &str,
    ) -> Result<FailureOutcome, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;
        let outcome = self.guard.record_failure(ip, Some(login), now, &policy);
        let failures = outcome.counts.iter().map(|(_, c)| *c).max().unwrap_or(0);

        let mut events = vec![
            AuditEvent::new(AuditAction::LoginFailed, now)
                .login(login)
                .ip(ip)
                .user_agent(user_agent)
                .reason(reason)
                .detail(AuditDetail::LoginFailed { failures }),
        ];
        for key in &outcome.newly_locked {
            let action = match key {
                AttemptKey::Ip(_) => AuditAction::IpBlocked,
                AttemptKey::Login(_) => AuditAction::AccountLocked,
            };
            let failures = outcome
                .counts
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, c)| *c)
                .unwrap_or(failures);
            events.push(
                AuditEvent::new(action, now)
                    .login(login)
                    .ip(ip)
                    .user_agent(user_agent)
                    .reason("too many failed attempts")
                    .detail(AuditDetail::Lockout {
                        key: key.to_string(),
                        failures,
                        locked_until: Some(now + Duration::seconds(policy.lockout_duration_secs)),
                    }),
            );
        }
        self.audit.record_many(events).await?;
        Ok(outcome)
    }

    /// Successful password check: clear the counters and audit it.
    pub async fn record_login_success(
        &self,
        login: &str,
        user_id: i32,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), TesseraError> {
        let now = self.clock.now();
        self.guard.reset_failures(ip, Some(login));
        self.audit
            .record(
                AuditEvent::new(AuditAction::LoginSuccess, now)
                    .user(user_id)
                    .login(login)
                    .ip(ip)
                    .user_agent(user_agent),
            )
            .await
    }

    /// Rebuild lockout counters from recent `login_failed` entries.
    pub async fn restore_lockouts(&self) -> Result<usize, TesseraError> {
        let now = self.clock.now();
        let policy = self.settings.policy().await;
        let since = now - Duration::seconds(policy.lockout_duration_secs);
        let failures = self.audit.recent_failures(since).await?;
        let replayed = self.guard.replay_failures(failures, now, &policy);
        if replayed > 0 {
            tracing::info!(replayed, "lockout counters restored from audit log");
        }
        Ok(replayed)
    }

    // ── Reporting ──

    pub async fn session_statistics(&self) -> Result<SessionStatistics, TesseraError> {
        self.store.statistics(self.clock.now()).await
    }

    /// Login totals and failure hot spots over the last `hours`.
    pub async fn security_report(&self, hours: i64) -> Result<SecurityReport, TesseraError> {
        let now = self.clock.now();
        let active = self.store.statistics(now).await?.active_sessions;
        self.audit
            .security_report(now - Duration::hours(hours.max(1)), active)
            .await
    }

    pub async fn suspicious_activity(&self, hours: i64) -> Result<Vec<SuspiciousActivity>, TesseraError> {
        let since = self.clock.now() - Duration::hours(hours.max(1));
        self.audit.suspicious_activity(since).await
    }
}
