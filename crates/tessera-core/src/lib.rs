//! Session lifecycle and session security.
//!
//! `tessera-core` issues, validates, rotates and revokes user session tokens,
//! and guards them with brute-force lockouts, hijack heuristics and an
//! append-only audit trail. Credential verification lives outside this crate:
//! an authenticator verifies a password and then calls
//! [`SessionService::create_session`].

pub mod audit;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod logging;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod security;
pub mod service;
pub mod settings;
pub mod store;
pub mod testing;
pub mod token;

pub use audit::{AuditAction, AuditDetail, AuditEvent, AuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::TesseraError;
pub use security::SecurityGuard;
pub use service::{IssuedSession, RevokeReason, Rotation, SessionService, ValidatedSession};
pub use settings::{SessionPolicy, SettingsCache};
pub use store::{DbSessionStore, Session, SessionStore};
pub use token::TokenSigner;

/// Crate-wide result alias.
pub type Result<T, E = TesseraError> = std::result::Result<T, E>;
