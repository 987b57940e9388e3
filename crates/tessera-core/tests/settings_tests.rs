// Session policy: seeded defaults, validation and the reloading cache.

use std::collections::HashMap;

use tessera_core::TesseraError;
use tessera_core::settings::{
    DEFAULT_SETTINGS, LOCKOUT_DURATION, MAX_SESSIONS_PER_USER, SESSION_ROTATION_ENABLED,
    SESSION_TOKEN_LENGTH, SessionPolicy,
};
use tessera_core::testing::TestContext;

#[tokio::test]
async fn test_seeded_rows_match_defaults() {
    let ctx = TestContext::new().await;
    let rows = ctx.service.settings().rows().await.unwrap();
    assert_eq!(rows.len(), DEFAULT_SETTINGS.len());
    assert!(rows.iter().all(|row| row.description.is_some()));

    let policy = ctx.service.settings().refresh().await.unwrap();
    assert_eq!(policy, SessionPolicy::default());
}

#[tokio::test]
async fn test_update_is_visible_immediately() {
    let ctx = TestContext::new().await;
    assert_eq!(ctx.service.settings().policy().await.max_sessions_per_user, 5);

    let updated = ctx
        .service
        .settings()
        .update_setting(MAX_SESSIONS_PER_USER, " 3 ")
        .await
        .unwrap();
    assert_eq!(updated.max_sessions_per_user, 3);
    assert_eq!(ctx.service.settings().policy().await.max_sessions_per_user, 3);

    let row = ctx
        .service
        .settings()
        .rows()
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.key == MAX_SESSIONS_PER_USER)
        .unwrap();
    assert_eq!(row.value, "3");
}

#[tokio::test]
async fn test_update_is_stamped_by_the_service_clock() {
    let ctx = TestContext::new().await;
    ctx.advance_secs(3 * 86_400);
    ctx.service
        .settings()
        .update_setting(LOCKOUT_DURATION, "600")
        .await
        .unwrap();

    let row = ctx
        .service
        .settings()
        .rows()
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.key == LOCKOUT_DURATION)
        .unwrap();
    assert_eq!(row.updated_at, ctx.service.now().naive_utc());
}

#[tokio::test]
async fn test_invalid_updates_are_rejected() {
    let ctx = TestContext::new().await;
    let settings = ctx.service.settings();

    for (key, value) in [
        (MAX_SESSIONS_PER_USER, "0"),
        (LOCKOUT_DURATION, "-5"),
        (LOCKOUT_DURATION, "soon"),
        (SESSION_ROTATION_ENABLED, "maybe"),
        ("no_such_setting", "1"),
    ] {
        let err = settings.update_setting(key, value).await.unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)), "{key}={value}");
    }
    assert_eq!(settings.policy().await, SessionPolicy::default());
}

#[test]
fn test_bad_rows_fall_back_to_defaults() {
    let rows: HashMap<String, String> = [
        (MAX_SESSIONS_PER_USER, "ten"),
        (LOCKOUT_DURATION, "60"),
        (SESSION_ROTATION_ENABLED, "off"),
        ("legacy_key", "whatever"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let policy = SessionPolicy::from_settings(&rows);
    assert_eq!(policy.max_sessions_per_user, 5);
    assert_eq!(policy.lockout_duration_secs, 60);
    assert!(!policy.rotation_enabled);
}

#[test]
fn test_token_length_is_clamped() {
    let mut policy = SessionPolicy::default();
    policy.apply(SESSION_TOKEN_LENGTH, "4").unwrap();
    assert_eq!(policy.token_byte_length, 16);
    policy.apply(SESSION_TOKEN_LENGTH, "100000").unwrap();
    assert_eq!(policy.token_byte_length, 256);
}

#[test]
fn test_timeout_for() {
    let policy = SessionPolicy::default();
    assert_eq!(policy.timeout_for(false).num_seconds(), 3600);
    assert_eq!(policy.timeout_for(true).num_seconds(), 2_592_000);
}
