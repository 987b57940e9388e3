use chrono::NaiveDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditDetail, VersionedDetail};

/// Append-only audit row for login and session events.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "login_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub user_id: Option<i32>,

    /// Login name as typed; empty when unknown
    pub login: String,

    /// `AuditAction` in snake_case
    pub action: String,

    pub ip_address: Option<String>,

    pub user_agent: Option<String>,

    /// SHA-256 digest of the token involved, never the token itself
    pub session_token: Option<String>,

    pub success: bool,

    pub reason: Option<String>,

    /// Versioned JSON payload, see `AuditDetail`
    pub detail: Option<String>,

    pub created_at: NaiveDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed action, or `None` for values written by a newer schema.
    pub fn action(&self) -> Option<AuditAction> {
        self.action.parse().ok()
    }

    /// Parsed detail payload. Unknown versions and malformed JSON yield `None`.
    pub fn detail(&self) -> Option<AuditDetail> {
        let raw = self.detail.as_deref()?;
        let versioned: VersionedDetail = serde_json::from_str(raw).ok()?;
        (versioned.v == VersionedDetail::CURRENT).then_some(versioned.detail)
    }
}
