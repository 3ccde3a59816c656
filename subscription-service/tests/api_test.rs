mod common;

use axum::{
    Extension, Json, Router,
    body::Body,
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    routing::post,
};
use common::{CALLBACK_URL, TestApp, WEBHOOK_SECRET, counter};
use serde_json::{Value, json};
use service_core::utils::sign_payload;
use subscription_service::build_router;
use subscription_service::middleware::{USER_ID_HEADER, USER_ROLE_HEADER, enforce_entitlement};
use subscription_service::models::{EntitlementType, PaymentStatus};
use subscription_service::policies::PolicyResult;
use tower::util::ServiceExt;
use uuid::Uuid;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get_as(uri: &str, user: Uuid) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(USER_ID_HEADER, user.to_string())
        .body(Body::empty())
        .unwrap()
}

fn json_as(method: &str, uri: &str, user: Uuid, role: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_ID_HEADER, user.to_string())
        .header(USER_ROLE_HEADER, role)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(body: &Value, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/subscription/webhook")
        .header("Content-Type", "application/json")
        .header("x-paystack-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_service() {
    let app = TestApp::new();
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "subscription-service");

    let (status, body) = send(
        &router,
        Request::builder().uri("/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage"], true);
}

#[tokio::test]
async fn readiness_fails_when_cache_is_down() {
    let app = TestApp::with_failing_cache();
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        Request::builder().uri("/ready").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["cache"], false);
}

#[tokio::test]
async fn protected_routes_need_user_header() {
    let app = TestApp::new();
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        Request::builder()
            .uri("/subscription/current-plan")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Missing X-User-ID header");

    let (status, _) = send(
        &router,
        Request::builder()
            .uri("/subscription/current-plan")
            .header(USER_ID_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn plans_are_listed_publicly() {
    let app = TestApp::new();
    app.seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(50.0))])
        .await;
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        Request::builder()
            .uri("/subscription/plans")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let plans = body.as_array().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0]["name"], "Pro");
    assert_eq!(plans[0]["features"][0]["featureKey"], "quiz");
}

#[tokio::test]
async fn checkout_then_verify_activates() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(50.0))])
        .await;
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        json_as(
            "POST",
            "/subscription/checkout",
            user,
            "user",
            json!({ "planId": plan, "callbackUrl": CALLBACK_URL }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let reference = body["reference"].as_str().unwrap().to_string();
    assert!(body["authorizationUrl"].as_str().is_some());

    let (status, body) = send(
        &router,
        json_as(
            "POST",
            "/subscription/verify",
            user,
            "user",
            json!({ "reference": format!("  {reference} ") }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["planId"], plan.to_string());

    let (status, body) = send(&router, get_as("/subscription/current-plan", user)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"]["name"], "Pro");
    assert_eq!(body["usage"]["quiz"]["allowed"], true);
    assert_eq!(body["usage"]["quiz"]["metadata"]["limit"], 50.0);
}

#[tokio::test]
async fn checkout_rejects_invalid_callback() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app.seed_plan("Pro", "2500", &[]).await;
    let router = build_router(app.state.clone());

    let (status, _) = send(
        &router,
        json_as(
            "POST",
            "/subscription/checkout",
            user,
            "user",
            json!({ "planId": plan, "callbackUrl": "not a url" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn current_plan_without_subscription_is_not_found() {
    let app = TestApp::new();
    let user = app.seed_user();
    let router = build_router(app.state.clone());

    let (status, body) = send(&router, get_as("/subscription/current-plan", user)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No active subscription");
}

#[tokio::test]
async fn webhook_rejects_bad_signature() {
    let app = TestApp::new();
    let router = build_router(app.state.clone());
    let body = json!({ "event": "charge.success", "data": { "reference": "sub_x" } });

    let (status, _) = send(&router, webhook(&body, "deadbeef")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let unsigned = Request::builder()
        .method("POST")
        .uri("/subscription/webhook")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _) = send(&router, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_charge_success_activates() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app.seed_plan("Pro", "2500", &[]).await;
    let reference = app.checkout(user, plan).await;
    let router = build_router(app.state.clone());

    let body = json!({ "event": "charge.success", "data": { "reference": reference } });
    let signature = sign_payload(WEBHOOK_SECRET.as_bytes(), body.to_string().as_bytes()).unwrap();

    let (status, response) = send(&router, webhook(&body, &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["received"], true);
    assert_eq!(app.payment(&reference).await.status(), PaymentStatus::Success);

    // Redelivery is acknowledged without a second activation.
    let (status, _) = send(&router, webhook(&body, &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.store.activation_count(), 1);
}

#[tokio::test]
async fn webhook_for_unknown_reference_is_acknowledged() {
    let app = TestApp::new();
    let router = build_router(app.state.clone());
    let body = json!({ "event": "charge.success", "data": { "reference": "sub_missing" } });
    let signature = sign_payload(WEBHOOK_SECRET.as_bytes(), body.to_string().as_bytes()).unwrap();

    let (status, _) = send(&router, webhook(&body, &signature)).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn webhook_surfaces_gateway_outage_for_redelivery() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app.seed_plan("Pro", "2500", &[]).await;
    let reference = app.checkout(user, plan).await;
    app.gateway.set_unavailable(true);
    let router = build_router(app.state.clone());

    let body = json!({ "event": "charge.success", "data": { "reference": reference } });
    let signature = sign_payload(WEBHOOK_SECRET.as_bytes(), body.to_string().as_bytes()).unwrap();
    let (status, _) = send(&router, webhook(&body, &signature)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let app = TestApp::new();
    let user = app.seed_user();
    let router = build_router(app.state.clone());

    let (status, body) = send(
        &router,
        json_as(
            "POST",
            "/admin/plans",
            user,
            "user",
            json!({ "name": "Pro", "price": "2500", "billingInterval": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Admin role required");
}

#[tokio::test]
async fn admin_manages_catalog() {
    let app = TestApp::new();
    let admin = app.seed_user_with_role("admin");
    let router = build_router(app.state.clone());

    let (status, plan) = send(
        &router,
        json_as(
            "POST",
            "/admin/plans",
            admin,
            "admin",
            json!({ "name": "Pro", "price": "2500", "billingInterval": "monthly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(plan["currency"], "NGN");
    let plan_id = plan["planId"].as_str().unwrap().to_string();

    let (status, entitlement) = send(
        &router,
        json_as(
            "POST",
            "/admin/entitlements",
            admin,
            "admin",
            json!({ "featureKey": "quiz", "name": "Quizzes", "type": "counter" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let entitlement_id = entitlement["entitlementId"].as_str().unwrap().to_string();

    let link = format!("/admin/plans/{plan_id}/entitlements/{entitlement_id}");
    let (status, _) = send(
        &router,
        json_as("PUT", &link, admin, "admin", json!({ "value": { "limit": 5 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, plan) = send(
        &router,
        json_as("PUT", &link, admin, "admin", json!({ "value": 25 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["features"][0]["featureKey"], "quiz");
    assert_eq!(plan["features"][0]["value"], 25.0);

    let (status, updated) = send(
        &router,
        json_as(
            "PATCH",
            &format!("/admin/plans/{plan_id}"),
            admin,
            "admin",
            json!({ "price": "3000" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["price"], "3000");

    let (status, _) = send(
        &router,
        json_as(
            "PATCH",
            &format!("/admin/entitlements/{entitlement_id}"),
            admin,
            "admin",
            json!({ "type": "boolean" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, removal) = send(
        &router,
        json_as(
            "DELETE",
            &format!("/admin/plans/{plan_id}"),
            admin,
            "admin",
            Value::Null,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removal["result"], "deleted");
}

#[tokio::test]
async fn plan_in_use_is_deactivated_not_deleted() {
    let app = TestApp::new();
    let admin = app.seed_user_with_role("admin");
    let user = app.seed_user();
    let plan = app.seed_plan("Pro", "2500", &[]).await;
    app.subscribe(user, plan).await;
    let router = build_router(app.state.clone());

    let (status, removal) = send(
        &router,
        json_as(
            "DELETE",
            &format!("/admin/plans/{plan}"),
            admin,
            "admin",
            Value::Null,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(removal["result"], "deactivated");

    let (_, plans) = send(
        &router,
        Request::builder()
            .uri("/subscription/plans")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert!(plans.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn entitlement_check_endpoints() {
    let app = TestApp::new();
    let user = app.seed_user();
    let plan = app
        .seed_plan(
            "Pro",
            "2500",
            &[
                ("quiz", EntitlementType::Counter, counter(5.0)),
                ("support_tier", EntitlementType::Level, json!(1)),
            ],
        )
        .await;
    app.subscribe(user, plan).await;
    let router = build_router(app.state.clone());

    let (status, body) = send(&router, get_as("/entitlements/quiz", user)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["metadata"]["remaining"], 5.0);

    let (status, body) = send(
        &router,
        get_as("/entitlements/support_tier?requiredLevel=3", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);

    let (status, body) = send(
        &router,
        json_as(
            "POST",
            "/entitlements/check",
            user,
            "user",
            json!({ "keys": ["quiz", "video"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"]["quiz"]["allowed"], true);
    assert_eq!(body["results"]["video"]["allowed"], false);
}

async fn take_quiz(Extension(result): Extension<PolicyResult>) -> Json<PolicyResult> {
    Json(result)
}

#[tokio::test]
async fn gate_consumes_and_denies_past_limit() {
    let app = TestApp::new();
    let user = app.seed_user();
    let admin = app.seed_user_with_role("admin");
    let plan = app
        .seed_plan("Pro", "2500", &[("quiz", EntitlementType::Counter, counter(2.0))])
        .await;
    app.subscribe(user, plan).await;

    let gate = app.state.entitlement_gate("quiz").consuming(1.0);
    let router = Router::new()
        .route("/quiz", post(take_quiz))
        .route_layer(from_fn_with_state(gate, enforce_entitlement));

    for expected_used in [1.0, 2.0] {
        let (status, body) = send(&router, json_as("POST", "/quiz", user, "user", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["used"], expected_used);
    }

    let (status, body) = send(&router, json_as("POST", "/quiz", user, "user", json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Usage limit of 2 reached");

    // Admins bypass the gate without consuming.
    let (status, body) = send(&router, json_as("POST", "/quiz", admin, "admin", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
}
