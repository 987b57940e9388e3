//! Persistence of session rows.
//!
//! Tokens cross this boundary in raw form and are hashed here; nothing below
//! the store ever sees a usable token. Every mutation other than deactivation
//! is conditioned on `is_active = true`, so a revoked row can never be
//! refreshed or re-keyed back into service.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;

use crate::error::TesseraError;
use crate::models::session::{self, Entity as SessionEntity};
use crate::token::hash_token;

/// A session as seen by the service layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: i32,
    pub user_id: i32,
    /// SHA-256 digest of the current token
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    /// Last observed client address
    pub ip_address: Option<String>,
    /// Address the current token is signed for
    pub bound_ip: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl From<session::Model> for Session {
    fn from(m: session::Model) -> Self {
        Self {
            id: m.id,
            user_id: m.user_id,
            token_hash: m.token_hash,
            created_at: m.created_at.and_utc(),
            last_activity_at: m.last_activity_at.and_utc(),
            expires_at: m.expires_at.and_utc(),
            remember_me: m.remember_me,
            ip_address: m.ip_address,
            bound_ip: m.bound_ip,
            user_agent: m.user_agent,
            is_active: m.is_active,
        }
    }
}

/// Input for [`SessionStore::insert`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i32,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Aggregate counts for dashboards and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub active_sessions: u64,
    pub remember_me_sessions: u64,
    pub created_last_24h: u64,
    pub active_users: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new active session. A token collision is `DuplicateToken`.
    async fn insert(&self, new: NewSession) -> Result<Session, TesseraError>;

    /// Active row holding `token`, expired or not.
    async fn get_active_by_token(&self, token: &str) -> Result<Option<Session>, TesseraError>;

    async fn find_by_id(&self, id: i32) -> Result<Option<Session>, TesseraError>;

    /// Active, unexpired sessions for a user, least recently used first.
    async fn list_active_by_user(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, TesseraError>;

    /// Bump `last_activity_at` and record the observed address, if any.
    /// `false` when the row is no longer active.
    async fn touch_activity(
        &self,
        id: i32,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<bool, TesseraError>;

    /// Swap `old_token` for `new_token` and bind the new token to `ip_address`,
    /// but only if the row still holds `old_token` and is active. `false`
    /// means someone else won.
    async fn replace_token(
        &self,
        id: i32,
        old_token: &str,
        new_token: &str,
        ip_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, TesseraError>;

    /// `true` if this call flipped the row to inactive.
    async fn deactivate(&self, id: i32) -> Result<bool, TesseraError>;

    /// Deactivate every active session of a user. Returns the affected ids.
    async fn deactivate_all_for_user(&self, user_id: i32) -> Result<Vec<i32>, TesseraError>;

    /// Deactivate up to `limit` expired sessions in one transaction and return them.
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Session>, TesseraError>;

    /// Physically delete inactive rows last used before `horizon`.
    async fn purge_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64, TesseraError>;

    async fn statistics(&self, now: DateTime<Utc>) -> Result<SessionStatistics, TesseraError>;
}

/// SeaORM-backed store.
#[derive(Clone, Debug)]
pub struct DbSessionStore {
    db: DatabaseConnection,
}

impl DbSessionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn map_unique(err: DbErr) -> TesseraError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => TesseraError::DuplicateToken,
        _ => TesseraError::Store(err),
    }
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn insert(&self, new: NewSession) -> Result<Session, TesseraError> {
        let created_at = new.created_at.naive_utc();
        let model = session::ActiveModel {
            user_id: Set(new.user_id),
            token_hash: Set(hash_token(&new.token)),
            created_at: Set(created_at),
            last_activity_at: Set(created_at),
            expires_at: Set(new.expires_at.naive_utc()),
            remember_me: Set(new.remember_me),
            bound_ip: Set(new.ip_address.clone()),
            ip_address: Set(new.ip_address),
            user_agent: Set(new.user_agent),
            is_active: Set(true),
            ..Default::default()
        };

        let row = model.insert(&self.db).await.map_err(map_unique)?;
        Ok(row.into())
    }

    async fn get_active_by_token(&self, token: &str) -> Result<Option<Session>, TesseraError> {
        let row = SessionEntity::find()
            .filter(session::Column::TokenHash.eq(hash_token(token)))
            .filter(session::Column::IsActive.eq(true))
            .one(&self.db)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<Session>, TesseraError> {
        Ok(SessionEntity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(Into::into))
    }

    async fn list_active_by_user(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, TesseraError> {
        let rows = SessionEntity::find()
            .filter(session::Column::UserId.eq(user_id))
            .filter(session::Column::IsActive.eq(true))
            .filter(session::Column::ExpiresAt.gt(now.naive_utc()))
            .order_by_asc(session::Column::LastActivityAt)
            .order_by_asc(session::Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn touch_activity(
        &self,
        id: i32,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<bool, TesseraError> {
        let mut update = SessionEntity::update_many()
            .col_expr(session::Column::LastActivityAt, Expr::value(at.naive_utc()));
        if let Some(ip) = ip_address {
            update = update.col_expr(session::Column::IpAddress, Expr::value(ip.to_string()));
        }
        let res = update
            .filter(session::Column::Id.eq(id))
            .filter(session::Column::IsActive.eq(true))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    async fn replace_token(
        &self,
        id: i32,
        old_token: &str,
        new_token: &str,
        ip_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, TesseraError> {
        let res = SessionEntity::update_many()
            .col_expr(session::Column::TokenHash, Expr::value(hash_token(new_token)))
            .col_expr(
                session::Column::IpAddress,
                Expr::value(ip_address.map(str::to_string)),
            )
            .col_expr(
                session::Column::BoundIp,
                Expr::value(ip_address.map(str::to_string)),
            )
            .col_expr(session::Column::LastActivityAt, Expr::value(at.naive_utc()))
            .filter(session::Column::Id.eq(id))
            .filter(session::Column::TokenHash.eq(hash_token(old_token)))
            .filter(session::Column::IsActive.eq(true))
            .exec(&self.db)
            .await
            .map_err(map_unique)?;
        Ok(res.rows_affected == 1)
    }

    async fn deactivate(&self, id: i32) -> Result<bool, TesseraError> {
        let res = SessionEntity::update_many()
            .col_expr(session::Column::IsActive, Expr::value(false))
            .filter(session::Column::Id.eq(id))
            .filter(session::Column::IsActive.eq(true))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    async fn deactivate_all_for_user(&self, user_id: i32) -> Result<Vec<i32>, TesseraError> {
        let txn = self.db.begin().await?;

        let ids: Vec<i32> = SessionEntity::find()
            .select_only()
            .column(session::Column::Id)
            .filter(session::Column::UserId.eq(user_id))
            .filter(session::Column::IsActive.eq(true))
            .into_tuple()
            .all(&txn)
            .await?;

        if !ids.is_empty() {
            SessionEntity::update_many()
                .col_expr(session::Column::IsActive, Expr::value(false))
                .filter(session::Column::Id.is_in(ids.clone()))
                .filter(session::Column::IsActive.eq(true))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(ids)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Session>, TesseraError> {
        let txn = self.db.begin().await?;

        let expired = SessionEntity::find()
            .filter(session::Column::IsActive.eq(true))
            .filter(session::Column::ExpiresAt.lte(now.naive_utc()))
            .order_by_asc(session::Column::ExpiresAt)
            .order_by_asc(session::Column::Id)
            .limit(limit)
            .all(&txn)
            .await?;

        if !expired.is_empty() {
            let ids: Vec<i32> = expired.iter().map(|s| s.id).collect();
            SessionEntity::update_many()
                .col_expr(session::Column::IsActive, Expr::value(false))
                .filter(session::Column::Id.is_in(ids))
                .filter(session::Column::IsActive.eq(true))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(expired
            .into_iter()
            .map(|m| Session {
                is_active: false,
                ..m.into()
            })
            .collect())
    }

    async fn purge_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64, TesseraError> {
        let res = SessionEntity::delete_many()
            .filter(session::Column::IsActive.eq(false))
            .filter(session::Column::LastActivityAt.lt(horizon.naive_utc()))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    async fn statistics(&self, now: DateTime<Utc>) -> Result<SessionStatistics, TesseraError> {
        let naive_now = now.naive_utc();
        let active = || {
            SessionEntity::find()
                .filter(session::Column::IsActive.eq(true))
                .filter(session::Column::ExpiresAt.gt(naive_now))
        };

        let active_sessions = active().count(&self.db).await?;
        let remember_me_sessions = active()
            .filter(session::Column::RememberMe.eq(true))
            .count(&self.db)
            .await?;
        let created_last_24h = SessionEntity::find()
            .filter(session::Column::CreatedAt.gte((now - Duration::hours(24)).naive_utc()))
            .count(&self.db)
            .await?;
        let users: Vec<i32> = active()
            .select_only()
            .column(session::Column::UserId)
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(SessionStatistics {
            active_sessions,
            remember_me_sessions,
            created_last_24h,
            active_users: users.len() as u64,
        })
    }
}
