mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

use common::{platform, ADMIN, ORG};
use wellness_backend::app;

const MODERATOR: i32 = 101;
const MEMBER: i32 = 300;

fn token(user_id: i32, role: &str) -> String {
    std::env::set_var("JWT_SECRET", "secret");
    let claims = json!({"sub": user_id, "org": ORG, "role": role, "exp": 9999999999u64});
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"secret"),
    )
    .unwrap()
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn root_responds_ok() {
    let app = app(platform().platform);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Wellness Platform API".as_bytes());
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let app = app(platform().platform);
    let (status, _) = send(&app, Method::GET, "/api/billing/balance", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// key: api-tests -> billing endpoints
#[tokio::test]
async fn admin_purchase_shows_in_balance() {
    let app = app(platform().platform);
    let admin = token(ADMIN, "admin");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/billing/credits",
        Some(&admin),
        Some(json!({"amount": 100, "description": "starter pack"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transaction_type"], "purchase");

    let member = token(MEMBER, "member");
    let (status, body) = send(&app, Method::GET, "/api/billing/balance", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], "100");
    assert_eq!(body["tier"], "starter");
}

#[tokio::test]
async fn members_cannot_grant_credits() {
    let app = app(platform().platform);
    let member = token(MEMBER, "member");
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/billing/credits",
        Some(&member),
        Some(json!({"amount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn overdrawn_adjustment_is_payment_required() {
    let app = app(platform().platform);
    let admin = token(ADMIN, "admin");
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/billing/adjustments",
        Some(&admin),
        Some(json!({"amount": -5, "reason": "correction"})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "insufficient_credits");
}

// key: api-tests -> moderation endpoints
#[tokio::test]
async fn queued_content_is_claimed_and_decided() {
    let app = app(platform().platform);
    let admin = token(ADMIN, "admin");
    let moderator = token(MODERATOR, "moderator");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/moderation/items",
        Some(&admin),
        Some(json!({
            "content_type": "journal_prompt",
            "content_id": 42,
            "owner_id": 500,
            "scores": {
                "overall_score": 0.55,
                "age_appropriateness_score": 0.9,
                "clinical_safety_score": 0.8,
                "cultural_sensitivity_score": 0.9,
                "accuracy_score": 0.9,
                "flags": ["tone"]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["item"]["priority"], "high");
    assert_eq!(body["item"]["status"], "pending");

    let (status, claimed) = send(
        &app,
        Method::POST,
        "/api/moderation/queue/next",
        Some(&moderator),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["assigned_to"], MODERATOR);
    assert_eq!(claimed["status"], "in_progress");
    let item_id = claimed["id"].as_str().unwrap().to_string();
    let decision_uri = format!("/api/moderation/items/{item_id}/decision");

    let (status, _) = send(
        &app,
        Method::POST,
        &decision_uri,
        Some(&moderator),
        Some(json!({"notes": "missing decision"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, decided) = send(
        &app,
        Method::POST,
        &decision_uri,
        Some(&moderator),
        Some(json!({"decision": "approve", "notes": "fine"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["item"]["status"], "completed");
    assert_eq!(decided["decision"]["decision"], "approve");

    let (status, body) = send(
        &app,
        Method::POST,
        &decision_uri,
        Some(&moderator),
        Some(json!({"decision": "reject"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "item_closed");
}

#[tokio::test]
async fn members_cannot_work_the_queue() {
    let app = app(platform().platform);
    let member = token(MEMBER, "member");
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/moderation/queue/next",
        Some(&member),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
