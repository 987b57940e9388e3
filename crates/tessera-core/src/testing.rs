//! Test support: an in-memory database, a manual clock and a ready service.
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_expiry() {
//!     let ctx = TestContext::new().await;
//!     let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
//!     ctx.advance_secs(3601);
//!     assert!(ctx.service.validate_session(&issued.token, None, None).await.unwrap().is_none());
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::DatabaseConnection;

use crate::audit::{AuditAction, HistoryFilter};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::db;
use crate::migrations::{Migrator, MigratorTrait};
use crate::models::login_log;
use crate::service::SessionService;

/// 2025-03-01T12:00:00Z
const EPOCH: i64 = 1_740_830_400;

pub struct TestContext {
    pub db: DatabaseConnection,
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub service: Arc<SessionService>,
}

impl TestContext {
    /// Migrated in-memory SQLite with default policy.
    pub async fn new() -> Self {
        Self::with_config(Config::in_memory()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let db = db::connect(&config)
            .await
            .expect("Failed to connect to test database");
        Migrator::up(&db, None)
            .await
            .expect("Failed to run migrations");

        let start = DateTime::<Utc>::from_timestamp(EPOCH, 0).expect("valid epoch");
        let clock = Arc::new(ManualClock::new(start));
        let service = SessionService::with_clock(db.clone(), &config, clock.clone())
            .expect("Failed to build session service");

        Self {
            db,
            config,
            clock,
            service: Arc::new(service),
        }
    }

    /// Persist a policy value and reload it.
    pub async fn set_policy(&self, key: &str, value: &str) {
        self.service
            .settings()
            .update_setting(key, value)
            .await
            .expect("Failed to update setting");
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Audit entries, oldest first.
    pub async fn audit_entries(&self) -> Vec<login_log::Model> {
        let mut entries = self
            .service
            .audit()
            .history(HistoryFilter {
                limit: Some(10_000),
                ..Default::default()
            })
            .await
            .expect("Failed to read audit log");
        entries.reverse();
        entries
    }

    pub async fn audit_actions(&self) -> Vec<AuditAction> {
        self.audit_entries()
            .await
            .iter()
            .filter_map(login_log::Model::action)
            .collect()
    }

    pub async fn count_action(&self, action: AuditAction) -> usize {
        self.audit_actions()
            .await
            .into_iter()
            .filter(|a| *a == action)
            .count()
    }
}
