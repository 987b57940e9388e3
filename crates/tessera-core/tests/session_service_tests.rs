// SessionService lifecycle against an in-memory SQLite database.

use tessera_core::audit::AuditAction;
use tessera_core::settings::{
    DEFAULT_SESSION_TIMEOUT, INVALIDATE_ON_IP_CHANGE, MAX_SESSIONS_PER_USER,
    SESSION_ROTATION_INTERVAL,
};
use tessera_core::testing::TestContext;
use tessera_core::{RevokeReason, TesseraError};

const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FIREFOX_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

mod issuance_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_validate() {
        let ctx = TestContext::new().await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap();

        assert_eq!(issued.session.user_id, 1);
        assert!(issued.session.is_active);
        assert_eq!(
            issued.session.expires_at - issued.session.created_at,
            chrono::Duration::seconds(3600)
        );
        assert_ne!(issued.session.token_hash, issued.token, "raw token is not stored");

        let validated = ctx
            .service
            .validate_session(&issued.token, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap()
            .expect("session should validate");
        assert_eq!(validated.session.id, issued.session.id);
        assert!(!validated.rotated);
        assert_eq!(validated.token, issued.token);

        let actions = ctx.audit_actions().await;
        assert_eq!(actions, vec![AuditAction::SessionCreated, AuditAction::SessionValidated]);
    }

    #[tokio::test]
    async fn test_remember_me_uses_long_timeout() {
        let ctx = TestContext::new().await;
        let issued = ctx.service.create_session(1, true, None, None).await.unwrap();
        assert!(issued.session.remember_me);
        assert_eq!(
            issued.session.expires_at - issued.session.created_at,
            chrono::Duration::seconds(2_592_000)
        );

        ctx.advance_secs(7200);
        assert!(
            ctx.service
                .validate_session(&issued.token, None, None)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_tokens() {
        let ctx = TestContext::new().await;
        assert!(ctx.service.validate_session("garbage", None, None).await.unwrap().is_none());

        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        let mut forged = issued.token.clone();
        forged.pop();
        forged.push(if issued.token.ends_with('0') { '1' } else { '0' });
        assert!(ctx.service.validate_session(&forged, None, None).await.unwrap().is_none());

        assert_eq!(ctx.count_action(AuditAction::InvalidToken).await, 2);
        // The genuine token is unaffected.
        assert!(ctx.service.validate_session(&issued.token, None, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticate_maps_denial_to_error() {
        let ctx = TestContext::new().await;
        let err = ctx.service.authenticate("nope", None, None).await.unwrap_err();
        assert!(matches!(err, TesseraError::Authentication));
    }
}

mod expiry_tests {
    use super::*;

    #[tokio::test]
    async fn test_session_expires_after_timeout() {
        let ctx = TestContext::new().await;
        ctx.set_policy(DEFAULT_SESSION_TIMEOUT, "1").await;

        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(2);

        let result = ctx.service.validate_session(&issued.token, None, None).await.unwrap();
        assert!(result.is_none());
        assert_eq!(ctx.count_action(AuditAction::SessionExpired).await, 1);

        let row = ctx.service.store().find_by_id(issued.session.id).await.unwrap().unwrap();
        assert!(!row.is_active);
    }

    #[tokio::test]
    async fn test_cleanup_expired_sweeps_and_audits() {
        let ctx = TestContext::new().await;
        ctx.set_policy(DEFAULT_SESSION_TIMEOUT, "10").await;
        for user in 1..=3 {
            ctx.service.create_session(user, false, None, None).await.unwrap();
        }
        let keeper = ctx.service.create_session(4, true, None, None).await.unwrap();
        ctx.advance_secs(11);

        assert_eq!(ctx.service.cleanup_expired().await.unwrap(), 3);
        assert_eq!(ctx.service.cleanup_expired().await.unwrap(), 0);
        assert_eq!(ctx.count_action(AuditAction::SessionExpired).await, 3);
        assert!(ctx.service.validate_session(&keeper.token, None, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_batches() {
        let mut config = tessera_core::Config::in_memory();
        config.cleanup_batch_size = 2;
        let ctx = TestContext::with_config(config).await;
        ctx.set_policy(DEFAULT_SESSION_TIMEOUT, "10").await;
        for user in 1..=5 {
            ctx.service.create_session(user, false, None, None).await.unwrap();
        }
        ctx.advance_secs(11);
        assert_eq!(ctx.service.cleanup_expired().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_cleanup_does_nothing() {
        let ctx = TestContext::new().await;
        ctx.set_policy(DEFAULT_SESSION_TIMEOUT, "10").await;
        ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(11);

        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        assert_eq!(ctx.service.cleanup_expired_until(&cancel).await.unwrap(), 0);
        assert_eq!(ctx.service.cleanup_expired().await.unwrap(), 1);
    }
}

mod limit_tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_oldest_session_is_evicted() {
        let ctx = TestContext::new().await;
        ctx.set_policy(MAX_SESSIONS_PER_USER, "2").await;

        let first = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(1);
        let second = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(1);
        let third = ctx.service.create_session(1, false, None, None).await.unwrap();

        let active = ctx.service.list_active_sessions(1).await.unwrap();
        let ids: Vec<i32> = active.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![third.session.id, second.session.id], "most recent first");

        assert!(ctx.service.validate_session(&first.token, None, None).await.unwrap().is_none());
        assert_eq!(ctx.count_action(AuditAction::SessionLimitEvicted).await, 1);
    }

    #[tokio::test]
    async fn test_default_limit_keeps_most_recently_active() {
        let ctx = TestContext::new().await;
        let mut issued = Vec::new();
        for _ in 0..5 {
            issued.push(ctx.service.create_session(1, false, None, None).await.unwrap());
            ctx.advance_secs(1);
        }
        ctx.service.validate_session(&issued[0].token, None, None).await.unwrap().unwrap();
        for _ in 0..3 {
            ctx.advance_secs(1);
            issued.push(ctx.service.create_session(1, false, None, None).await.unwrap());
        }

        let ids: Vec<i32> = ctx
            .service
            .list_active_sessions(1)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        let expected: Vec<i32> = [7, 6, 5, 0, 4].iter().map(|&i| issued[i].session.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(ctx.count_action(AuditAction::SessionLimitEvicted).await, 3);
        for evicted in &issued[1..4] {
            assert!(ctx.service.validate_session(&evicted.token, None, None).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_recently_used_session_survives_eviction() {
        let ctx = TestContext::new().await;
        ctx.set_policy(MAX_SESSIONS_PER_USER, "2").await;

        let first = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(1);
        let second = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.advance_secs(1);
        ctx.service.validate_session(&first.token, None, None).await.unwrap().unwrap();
        ctx.advance_secs(1);
        ctx.service.create_session(1, false, None, None).await.unwrap();

        assert!(ctx.service.validate_session(&first.token, None, None).await.unwrap().is_some());
        assert!(ctx.service.validate_session(&second.token, None, None).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_limit() {
        let ctx = TestContext::new().await;
        let service = Arc::clone(&ctx.service);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.create_session(9, false, None, None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ctx.service.list_active_sessions(9).await.unwrap().len(), 5);
        assert_eq!(ctx.count_action(AuditAction::SessionLimitEvicted).await, 15);
    }

    #[tokio::test]
    async fn test_enforce_limit_after_policy_change() {
        let ctx = TestContext::new().await;
        for _ in 0..4 {
            ctx.service.create_session(1, false, None, None).await.unwrap();
            ctx.advance_secs(1);
        }
        ctx.set_policy(MAX_SESSIONS_PER_USER, "2").await;
        assert_eq!(ctx.service.enforce_session_limit(1).await.unwrap(), 2);
        assert_eq!(ctx.service.list_active_sessions(1).await.unwrap().len(), 2);
        assert_eq!(ctx.service.enforce_session_limit(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_limit_is_per_user() {
        let ctx = TestContext::new().await;
        ctx.set_policy(MAX_SESSIONS_PER_USER, "1").await;
        let a = ctx.service.create_session(1, false, None, None).await.unwrap();
        let b = ctx.service.create_session(2, false, None, None).await.unwrap();
        assert!(ctx.service.validate_session(&a.token, None, None).await.unwrap().is_some());
        assert!(ctx.service.validate_session(&b.token, None, None).await.unwrap().is_some());
    }
}

mod revocation_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalidate_is_idempotent_and_audited() {
        let ctx = TestContext::new().await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();

        assert!(ctx.service.invalidate_session(&issued.token, RevokeReason::Logout).await.unwrap());
        assert!(!ctx.service.invalidate_session(&issued.token, RevokeReason::Logout).await.unwrap());
        assert!(!ctx.service.invalidate_session("not-a-token", RevokeReason::Logout).await.unwrap());

        assert_eq!(ctx.count_action(AuditAction::LogoutManual).await, 3);
        assert!(ctx.service.validate_session(&issued.token, None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoked_session_is_never_revived() {
        let ctx = TestContext::new().await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.service
            .invalidate_session(&issued.token, RevokeReason::Admin)
            .await
            .unwrap();

        let store = ctx.service.store();
        let now = ctx.service.now();
        assert!(!store.touch_activity(issued.session.id, now, None).await.unwrap());
        assert!(
            !store
                .replace_token(issued.session.id, &issued.token, "other", None, now)
                .await
                .unwrap()
        );
        assert!(!store.find_by_id(issued.session.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_invalidate_all_for_user() {
        let ctx = TestContext::new().await;
        let tokens: Vec<String> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(ctx.service.create_session(1, false, None, None).await.unwrap().token);
            }
            v
        };
        let other = ctx.service.create_session(2, false, None, None).await.unwrap();

        let ended = ctx
            .service
            .invalidate_all_for_user(1, RevokeReason::PasswordChanged)
            .await
            .unwrap();
        assert_eq!(ended, 3);
        for token in &tokens {
            assert!(ctx.service.validate_session(token, None, None).await.unwrap().is_none());
        }
        assert!(ctx.service.validate_session(&other.token, None, None).await.unwrap().is_some());

        assert_eq!(
            ctx.service
                .invalidate_all_for_user(1, RevokeReason::PasswordChanged)
                .await
                .unwrap(),
            0
        );
        assert_eq!(ctx.count_action(AuditAction::AllSessionsInvalidated).await, 2);
    }

    #[tokio::test]
    async fn test_invalidate_by_id() {
        let ctx = TestContext::new().await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        assert!(
            ctx.service
                .invalidate_session_by_id(issued.session.id, RevokeReason::Admin)
                .await
                .unwrap()
        );
        assert!(
            !ctx.service
                .invalidate_session_by_id(issued.session.id, RevokeReason::Admin)
                .await
                .unwrap()
        );

        let err = ctx
            .service
            .invalidate_session_by_id(9999, RevokeReason::Admin)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::RecordNotFound(_)));
        assert_eq!(ctx.count_action(AuditAction::SessionRevoked).await, 2);
    }
}

mod rotation_tests {
    use super::*;
    use tessera_core::Rotation;

    #[tokio::test]
    async fn test_rotation_hands_back_a_new_token() {
        let ctx = TestContext::new().await;
        ctx.set_policy(SESSION_ROTATION_INTERVAL, "60").await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap();

        ctx.advance_secs(61);
        let validated = ctx
            .service
            .validate_session(&issued.token, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap()
            .expect("valid");
        assert!(validated.rotated);
        assert_ne!(validated.token, issued.token);
        assert_eq!(validated.session.id, issued.session.id);

        // Old token is dead, new token works and is not rotated again.
        assert!(
            ctx.service
                .validate_session(&issued.token, Some("10.0.0.1"), Some(CHROME_WIN))
                .await
                .unwrap()
                .is_none()
        );
        let again = ctx
            .service
            .validate_session(&validated.token, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap()
            .expect("rotated token is valid");
        assert!(!again.rotated);
        assert_eq!(ctx.count_action(AuditAction::SessionRotated).await, 1);
    }

    #[tokio::test]
    async fn test_rotate_if_due() {
        let ctx = TestContext::new().await;
        ctx.set_policy(SESSION_ROTATION_INTERVAL, "60").await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();

        assert_eq!(
            ctx.service.rotate_if_due(&issued.session, &issued.token).await.unwrap(),
            Rotation::Unchanged
        );

        ctx.advance_secs(60);
        let Rotation::Rotated(new_token) = ctx
            .service
            .rotate_if_due(&issued.session, &issued.token)
            .await
            .unwrap()
        else {
            panic!("rotation was due");
        };

        // A second rotation of the same old token loses the race.
        assert_eq!(
            ctx.service.rotate_if_due(&issued.session, &issued.token).await.unwrap(),
            Rotation::Superseded
        );
        assert!(ctx.service.validate_session(&new_token, None, None).await.unwrap().is_some());
    }
}

mod security_tests {
    use super::*;

    #[tokio::test]
    async fn test_hijack_revokes_every_session_of_the_user() {
        let ctx = TestContext::new().await;
        let victim = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap();
        let other_device = ctx
            .service
            .create_session(1, false, Some("10.0.0.50"), Some(FIREFOX_LINUX))
            .await
            .unwrap();

        let result = ctx
            .service
            .validate_session(&victim.token, Some("198.51.100.7"), Some(FIREFOX_LINUX))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(
            ctx.service
                .validate_session(&other_device.token, Some("10.0.0.50"), Some(FIREFOX_LINUX))
                .await
                .unwrap()
                .is_none()
        );
        assert!(ctx.service.list_active_sessions(1).await.unwrap().is_empty());

        let entries = ctx.audit_entries().await;
        let hijack = entries
            .iter()
            .find(|e| e.action == "hijack_detected")
            .expect("hijack audited");
        match hijack.detail() {
            Some(tessera_core::AuditDetail::HijackDetected { revoked_sessions, indicators, .. }) => {
                assert_eq!(revoked_sessions, 2);
                assert_eq!(indicators.len(), 2);
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ip_change_keeps_token_until_rotation() {
        let ctx = TestContext::new().await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap();

        for _ in 0..2 {
            let moved = ctx
                .service
                .validate_session(&issued.token, Some("10.0.0.2"), Some(CHROME_WIN))
                .await
                .unwrap()
                .expect("one indicator is tolerated");
            assert!(!moved.rotated);
            assert_eq!(moved.token, issued.token);
            assert_eq!(moved.session.ip_address.as_deref(), Some("10.0.0.2"));
            assert_eq!(moved.session.bound_ip.as_deref(), Some("10.0.0.1"));
        }
        assert_eq!(ctx.count_action(AuditAction::IpChanged).await, 1);

        let stored = ctx.service.store().find_by_id(issued.session.id).await.unwrap().unwrap();
        assert_eq!(stored.ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(stored.bound_ip.as_deref(), Some("10.0.0.1"));

        // The next scheduled rotation signs for the new address.
        ctx.set_policy(SESSION_ROTATION_INTERVAL, "60").await;
        ctx.advance_secs(61);
        let rotated = ctx
            .service
            .validate_session(&issued.token, Some("10.0.0.2"), Some(CHROME_WIN))
            .await
            .unwrap()
            .expect("rotation is due");
        assert!(rotated.rotated);
        assert_eq!(rotated.session.bound_ip.as_deref(), Some("10.0.0.2"));
        assert!(
            ctx.service
                .validate_session(&rotated.token, Some("10.0.0.2"), Some(CHROME_WIN))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_single_indicator_is_audited_as_suspected() {
        let ctx = TestContext::new().await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), Some(CHROME_WIN))
            .await
            .unwrap();

        let validated = ctx
            .service
            .validate_session(&issued.token, Some("10.0.0.1"), Some(FIREFOX_LINUX))
            .await
            .unwrap();
        assert!(validated.is_some(), "a browser change alone does not end the session");
        assert_eq!(ctx.count_action(AuditAction::HijackSuspected).await, 1);
        assert_eq!(ctx.count_action(AuditAction::HijackDetected).await, 0);

        let entries = ctx.audit_entries().await;
        let suspected = entries
            .iter()
            .find(|e| e.action == "hijack_suspected")
            .expect("suspicion audited");
        assert!(suspected.success);
        match suspected.detail() {
            Some(tessera_core::AuditDetail::HijackDetected { session_id, revoked_sessions, indicators }) => {
                assert_eq!(session_id, issued.session.id);
                assert_eq!(revoked_sessions, 0);
                assert_eq!(
                    indicators,
                    vec![tessera_core::security::HijackIndicator::UserAgentFamilyChanged]
                );
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalidate_on_ip_change() {
        let ctx = TestContext::new().await;
        ctx.set_policy(INVALIDATE_ON_IP_CHANGE, "true").await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.1"), None)
            .await
            .unwrap();

        assert!(
            ctx.service
                .validate_session(&issued.token, Some("10.0.0.2"), None)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            !ctx.service
                .store()
                .find_by_id(issued.session.id)
                .await
                .unwrap()
                .unwrap()
                .is_active
        );
        assert_eq!(ctx.count_action(AuditAction::IpChanged).await, 1);
    }

    #[tokio::test]
    async fn test_lockout_blocks_session_creation() {
        let ctx = TestContext::new().await;
        let ip = Some("10.0.0.9");
        for _ in 0..5 {
            ctx.service
                .record_login_failure("alice", ip, None, "bad password")
                .await
                .unwrap();
        }
        assert!(!ctx.service.check_login_allowed(ip, None).await.unwrap());
        assert!(!ctx.service.check_login_allowed(None, Some("Alice")).await.unwrap());

        let err = ctx.service.create_session(1, false, ip, None).await.unwrap_err();
        assert!(matches!(err, TesseraError::Security(_)));
        assert_eq!(ctx.count_action(AuditAction::AccountLocked).await, 1);

        ctx.advance_secs(901);
        assert!(ctx.service.check_login_allowed(ip, Some("alice")).await.unwrap());
        ctx.service.create_session(1, false, ip, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_locked_ip_cannot_validate() {
        let ctx = TestContext::new().await;
        let issued = ctx
            .service
            .create_session(1, false, Some("10.0.0.9"), None)
            .await
            .unwrap();
        for _ in 0..5 {
            ctx.service
                .record_login_failure("mallory", Some("10.0.0.9"), None, "bad password")
                .await
                .unwrap();
        }
        assert!(
            ctx.service
                .validate_session(&issued.token, Some("10.0.0.9"), None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_successful_login_clears_failures() {
        let ctx = TestContext::new().await;
        for _ in 0..4 {
            ctx.service
                .record_login_failure("alice", Some("10.0.0.9"), None, "bad password")
                .await
                .unwrap();
        }
        ctx.service
            .record_login_success("alice", 1, Some("10.0.0.9"), None)
            .await
            .unwrap();
        ctx.service
            .record_login_failure("alice", Some("10.0.0.9"), None, "bad password")
            .await
            .unwrap();
        assert!(ctx.service.check_login_allowed(Some("10.0.0.9"), Some("alice")).await.unwrap());
    }

    #[tokio::test]
    async fn test_lockouts_survive_restart() {
        let ctx = TestContext::new().await;
        for _ in 0..5 {
            ctx.service
                .record_login_failure("alice", Some("10.0.0.9"), None, "bad password")
                .await
                .unwrap();
        }

        let restarted = tessera_core::SessionService::with_clock(
            ctx.db.clone(),
            &ctx.config,
            ctx.clock.clone(),
        )
        .unwrap();
        assert!(restarted.check_login_allowed(Some("10.0.0.9"), None).await.unwrap());
        assert_eq!(restarted.restore_lockouts().await.unwrap(), 5);
        assert!(!restarted.check_login_allowed(Some("10.0.0.9"), None).await.unwrap());
    }
}

mod reporting_tests {
    use super::*;

    #[tokio::test]
    async fn test_session_statistics() {
        let ctx = TestContext::new().await;
        ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.service.create_session(1, true, None, None).await.unwrap();
        let gone = ctx.service.create_session(2, false, None, None).await.unwrap();
        ctx.service.create_session(3, false, None, None).await.unwrap();
        ctx.service
            .invalidate_session(&gone.token, RevokeReason::Logout)
            .await
            .unwrap();

        let stats = ctx.service.session_statistics().await.unwrap();
        assert_eq!(stats.active_sessions, 3);
        assert_eq!(stats.remember_me_sessions, 1);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.created_last_24h, 4);
    }

    #[tokio::test]
    async fn test_retention_purges_old_rows() {
        let mut config = tessera_core::Config::in_memory();
        config.session_retention_days = Some(1);
        config.log_retention_days = Some(1);
        let ctx = TestContext::with_config(config).await;

        let old = ctx.service.create_session(1, false, None, None).await.unwrap();
        ctx.service
            .invalidate_session(&old.token, RevokeReason::Logout)
            .await
            .unwrap();
        ctx.advance_secs(2 * 86_400);
        let fresh = ctx.service.create_session(2, false, None, None).await.unwrap();

        let outcome = ctx.service.purge_retained().await.unwrap();
        assert_eq!(outcome.sessions, 1);
        assert_eq!(outcome.log_entries, 2);
        assert!(ctx.service.store().find_by_id(old.session.id).await.unwrap().is_none());
        assert!(ctx.service.store().find_by_id(fresh.session.id).await.unwrap().is_some());
        assert_eq!(ctx.audit_actions().await, vec![AuditAction::SessionCreated]);
    }
}

mod lost_write_tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tessera_core::store::{NewSession, SessionStatistics};
    use tessera_core::{DbSessionStore, Session, SessionService, SessionStore};

    /// Database store whose conditional writes report that another request won.
    struct LosingStore {
        inner: DbSessionStore,
        lose_touch: bool,
        lose_replace: bool,
    }

    #[async_trait]
    impl SessionStore for LosingStore {
        async fn insert(&self, new: NewSession) -> Result<Session, TesseraError> {
            self.inner.insert(new).await
        }

        async fn get_active_by_token(&self, token: &str) -> Result<Option<Session>, TesseraError> {
            self.inner.get_active_by_token(token).await
        }

        async fn find_by_id(&self, id: i32) -> Result<Option<Session>, TesseraError> {
            self.inner.find_by_id(id).await
        }

        async fn list_active_by_user(
            &self,
            user_id: i32,
            now: DateTime<Utc>,
        ) -> Result<Vec<Session>, TesseraError> {
            self.inner.list_active_by_user(user_id, now).await
        }

        async fn touch_activity(
            &self,
            id: i32,
            at: DateTime<Utc>,
            ip_address: Option<&str>,
        ) -> Result<bool, TesseraError> {
            if self.lose_touch {
                return Ok(false);
            }
            self.inner.touch_activity(id, at, ip_address).await
        }

        async fn replace_token(
            &self,
            id: i32,
            old_token: &str,
            new_token: &str,
            ip_address: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<bool, TesseraError> {
            if self.lose_replace {
                return Ok(false);
            }
            self.inner.replace_token(id, old_token, new_token, ip_address, at).await
        }

        async fn deactivate(&self, id: i32) -> Result<bool, TesseraError> {
            self.inner.deactivate(id).await
        }

        async fn deactivate_all_for_user(&self, user_id: i32) -> Result<Vec<i32>, TesseraError> {
            self.inner.deactivate_all_for_user(user_id).await
        }

        async fn sweep_expired(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Session>, TesseraError> {
            self.inner.sweep_expired(now, limit).await
        }

        async fn purge_inactive_before(&self, horizon: DateTime<Utc>) -> Result<u64, TesseraError> {
            self.inner.purge_inactive_before(horizon).await
        }

        async fn statistics(&self, now: DateTime<Utc>) -> Result<SessionStatistics, TesseraError> {
            self.inner.statistics(now).await
        }
    }

    fn losing_service(ctx: &TestContext, lose_touch: bool, lose_replace: bool) -> SessionService {
        let store = LosingStore {
            inner: DbSessionStore::new(ctx.db.clone()),
            lose_touch,
            lose_replace,
        };
        SessionService::with_clock(ctx.db.clone(), &ctx.config, ctx.clock.clone())
            .unwrap()
            .with_store(Arc::new(store))
    }

    async fn invalid_token_reasons(ctx: &TestContext) -> Vec<String> {
        ctx.audit_entries()
            .await
            .into_iter()
            .filter(|e| e.action == "invalid_token")
            .filter_map(|e| e.reason)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_touch_is_audited_as_inactive() {
        let ctx = TestContext::new().await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        let service = losing_service(&ctx, true, false);

        assert!(service.validate_session(&issued.token, None, None).await.unwrap().is_none());
        assert_eq!(invalid_token_reasons(&ctx).await, vec!["inactive".to_string()]);
        assert_eq!(ctx.count_action(AuditAction::SessionValidated).await, 0);
    }

    #[tokio::test]
    async fn test_lost_rotation_is_audited_as_superseded() {
        let ctx = TestContext::new().await;
        ctx.set_policy(SESSION_ROTATION_INTERVAL, "60").await;
        let issued = ctx.service.create_session(1, false, None, None).await.unwrap();
        let service = losing_service(&ctx, false, true);

        ctx.advance_secs(61);
        assert!(service.validate_session(&issued.token, None, None).await.unwrap().is_none());
        assert_eq!(invalid_token_reasons(&ctx).await, vec!["superseded".to_string()]);
        assert_eq!(ctx.count_action(AuditAction::SessionRotated).await, 0);
    }
}
