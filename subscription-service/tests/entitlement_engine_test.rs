//! Entitlement decisions and metering against in-memory storage.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{TestApp, counter, frequency};
use serde_json::json;
use service_core::error::AppError;
use subscription_service::models::EntitlementType;
use subscription_service::services::{CacheKey, CallMetadata, NO_ACTIVE_SUBSCRIPTION};

#[tokio::test]
async fn user_without_subscription_is_denied() {
    let app = TestApp::new();
    let user = app.seed_user();

    let result = app
        .state
        .engine
        .authorize(user, "quiz", CallMetadata::default())
        .await
        .unwrap();

    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some(NO_ACTIVE_SUBSCRIPTION));
}

#[tokio::test]
async fn feature_missing_from_plan_is_not_included() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(50.0))])
        .await;
    app.subscribe(user, plan).await;

    let result = app
        .state
        .engine
        .authorize(user, "export_pdf", CallMetadata::default())
        .await
        .unwrap();

    assert!(!result.allowed);
    assert!(result.reason.unwrap().contains("not included in your plan"));
}

#[tokio::test]
async fn fixed_limit_allows_exactly_the_limit() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(5.0))])
        .await;
    app.subscribe(user, plan).await;

    for call in 1..=5 {
        let result = app
            .state
            .engine
            .authorize_and_consume(user, "quiz", 1.0)
            .await
            .unwrap();
        assert!(result.allowed, "call {call} should be allowed");
        let meta = result.metadata.unwrap();
        assert_eq!(meta.used, call as f64);
        assert_eq!(meta.remaining, 5.0 - call as f64);
    }

    let denied = app
        .state
        .engine
        .authorize_and_consume(user, "quiz", 1.0)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.reason.as_deref(), Some("Usage limit of 5 reached"));
    assert_eq!(
        app.state.engine.usage().get_usage(user, "quiz").await.unwrap(),
        5.0
    );
}

#[tokio::test]
async fn authorize_does_not_consume() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(5.0))])
        .await;
    app.subscribe(user, plan).await;

    for _ in 0..10 {
        let result = app
            .state
            .engine
            .authorize(user, "quiz", CallMetadata::default())
            .await
            .unwrap();
        assert!(result.allowed);
    }
    assert_eq!(
        app.state.engine.usage().get_usage(user, "quiz").await.unwrap(),
        0.0
    );
}

#[tokio::test]
async fn frequency_limit_recovers_after_window() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[("ai_chat", EntitlementType::Frequency, frequency(3, "60s"))],
        )
        .await;
    app.subscribe(user, plan).await;

    for _ in 0..3 {
        let result = app
            .state
            .engine
            .authorize_and_consume(user, "ai_chat", 1.0)
            .await
            .unwrap();
        assert!(result.allowed);
    }

    let denied = app
        .state
        .engine
        .authorize_and_consume(user, "ai_chat", 1.0)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.metadata.unwrap().window_seconds, Some(60));

    app.clock.advance(Duration::seconds(61));

    let allowed = app
        .state
        .engine
        .authorize_and_consume(user, "ai_chat", 1.0)
        .await
        .unwrap();
    assert!(allowed.allowed);
}

#[tokio::test]
async fn level_compares_against_required_level() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[("support_tier", EntitlementType::Level, json!(2))],
        )
        .await;
    app.subscribe(user, plan).await;

    let engine = &app.state.engine;
    let meets = engine
        .authorize(user, "support_tier", CallMetadata { required_level: Some(2) })
        .await
        .unwrap();
    assert!(meets.allowed);

    let below = engine
        .authorize(user, "support_tier", CallMetadata { required_level: Some(3) })
        .await
        .unwrap();
    assert!(!below.allowed);
    assert_eq!(
        below.reason.as_deref(),
        Some("Requires level 3, your plan provides level 2")
    );

    let unspecified = engine
        .authorize(user, "support_tier", CallMetadata::default())
        .await
        .unwrap();
    assert!(unspecified.allowed);
}

#[tokio::test]
async fn boolean_features_gate_without_metering() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[
                ("export_pdf", EntitlementType::Boolean, json!(true)),
                ("white_label", EntitlementType::Boolean, json!(false)),
            ],
        )
        .await;
    app.subscribe(user, plan).await;

    let engine = &app.state.engine;
    assert!(
        engine
            .authorize_and_consume(user, "export_pdf", 1.0)
            .await
            .unwrap()
            .allowed
    );
    assert!(
        !engine
            .authorize(user, "white_label", CallMetadata::default())
            .await
            .unwrap()
            .allowed
    );
    assert_eq!(engine.usage().get_usage(user, "export_pdf").await.unwrap(), 0.0);
}

#[tokio::test]
async fn free_fallback_plan_meters_quiz_end_to_end() {
    let app = TestApp::with_fallback("Free");
    let user = app.seed_user();
    app.seed_plan("Free", "0", &[("quiz", EntitlementType::Counter, counter(5.0))])
        .await;

    let mut last = None;
    for _ in 0..5 {
        let result = app
            .state
            .engine
            .authorize_and_consume(user, "quiz", 1.0)
            .await
            .unwrap();
        assert!(result.allowed);
        last = result.metadata;
    }
    assert_eq!(last.unwrap().used, 5.0);

    let sixth = app
        .state
        .engine
        .authorize_and_consume(user, "quiz", 1.0)
        .await
        .unwrap();
    assert!(!sixth.allowed);
}

#[tokio::test]
async fn concurrent_consumption_never_overshoots() {
    let app = Arc::new(TestApp::new());
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(5.0))])
        .await;
    app.subscribe(user, plan).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = app.state.engine.clone();
            tokio::spawn(async move { engine.authorize_and_consume(user, "quiz", 1.0).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().allowed {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(
        app.state.engine.usage().get_usage(user, "quiz").await.unwrap(),
        5.0
    );
}

#[tokio::test]
async fn plan_edits_are_visible_immediately() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(1.0))])
        .await;
    app.subscribe(user, plan).await;

    let engine = &app.state.engine;
    assert!(engine.authorize_and_consume(user, "quiz", 1.0).await.unwrap().allowed);
    assert!(!engine.authorize(user, "quiz", CallMetadata::default()).await.unwrap().allowed);

    let cache = app.memory_cache.as_ref().unwrap();
    assert!(cache.contains(&CacheKey::PlanEntitlements(plan)));

    let quiz = app.entitlement("quiz", EntitlementType::Counter).await;
    app.state
        .catalog
        .set_plan_entitlement(plan, quiz, &counter(10.0))
        .await
        .unwrap();

    let result = engine
        .authorize(user, "quiz", CallMetadata::default())
        .await
        .unwrap();
    assert!(result.allowed);
    assert_eq!(result.metadata.unwrap().limit, 10.0);
}

#[tokio::test]
async fn decisions_survive_cache_outage() {
    let app = TestApp::with_failing_cache();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(2.0))])
        .await;
    app.subscribe(user, plan).await;

    let engine = &app.state.engine;
    assert!(engine.authorize_and_consume(user, "quiz", 1.0).await.unwrap().allowed);
    assert!(engine.authorize_and_consume(user, "quiz", 1.0).await.unwrap().allowed);
    assert!(!engine.authorize_and_consume(user, "quiz", 1.0).await.unwrap().allowed);
}

#[tokio::test]
async fn authorize_many_evaluates_each_key() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[
                ("quiz", EntitlementType::Counter, counter(5.0)),
                ("export_pdf", EntitlementType::Boolean, json!(false)),
            ],
        )
        .await;
    app.subscribe(user, plan).await;

    let keys = vec![
        "quiz".to_string(),
        "export_pdf".to_string(),
        "video".to_string(),
    ];
    let results = app.state.engine.authorize_many(user, &keys).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results["quiz"].allowed);
    assert!(!results["export_pdf"].allowed);
    assert!(!results["video"].allowed);
}

#[tokio::test]
async fn consumption_amount_must_be_positive() {
    let app = TestApp::new();
    let user = app.seed_user();

    for amount in [0.0, -1.0, f64::NAN] {
        let err = app
            .state
            .engine
            .authorize_and_consume(user, "quiz", amount)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}

#[tokio::test]
async fn fractional_consumption_is_metered() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[("storage_gb", EntitlementType::Counter, counter(1.0))],
        )
        .await;
    app.subscribe(user, plan).await;

    let engine = &app.state.engine;
    let first = engine
        .authorize_and_consume(user, "storage_gb", 0.75)
        .await
        .unwrap();
    assert_eq!(first.metadata.unwrap().remaining, 0.25);
    assert!(
        engine
            .authorize_and_consume(user, "storage_gb", 0.75)
            .await
            .unwrap()
            .allowed
    );
    assert!(
        !engine
            .authorize_and_consume(user, "storage_gb", 0.1)
            .await
            .unwrap()
            .allowed
    );
}
