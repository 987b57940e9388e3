use chrono::NaiveDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Server-side session row.
///
/// The raw token is never stored; `token_hash` holds its SHA-256 digest.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// The user who owns this session
    pub user_id: i32,

    /// SHA-256 hex digest of the current session token
    #[sea_orm(unique)]
    pub token_hash: String,

    pub created_at: NaiveDateTime,

    pub last_activity_at: NaiveDateTime,

    /// Absolute expiry; never moved by activity
    pub expires_at: NaiveDateTime,

    #[sea_orm(default_value = false)]
    pub remember_me: bool,

    /// Address the session was last seen from
    pub ip_address: Option<String>,

    /// Address the current token's signature covers
    pub bound_ip: Option<String>,

    pub user_agent: Option<String>,

    /// Goes from true to false exactly once
    #[sea_orm(default_value = true)]
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
