//! End-to-end tests of the local API
//!
//! These drive the full router (CORS, token middleware, handlers and the
//! in-memory store) the way a browser client would.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use infra::api::CorsPolicy;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::util::ServiceExt;
use tracing_test::traced_test;

use crate::{
    app::create_app,
    authorizer::TokenVerifier,
    handlers::ListService,
    store::MemoryStore,
};

const SECRET: &[u8] = b"integration-secret";
const ISSUER: &str = "https://cognito-idp.us-west-2.amazonaws.com/us-west-2_Integration";
const CLIENT_ID: &str = "integration-client";

fn create_test_app() -> (Router, MemoryStore) {
    let store = MemoryStore::new();
    let verifier = TokenVerifier::hs256(ISSUER, CLIENT_ID, SECRET);
    let app = create_app(
        ListService::new(Arc::new(store.clone())),
        Arc::new(verifier),
        &CorsPolicy::default(),
    );
    (app, store)
}

fn id_token(sub: &str) -> String {
    let claims = json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "token_use": "id",
        "email": format!("{sub}@example.com"),
        "exp": OffsetDateTime::now_utc().unix_timestamp() + 3600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            request = request.header("Content-Type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

#[tokio::test]
#[traced_test]
async fn test_create_without_token_is_rejected_before_the_store() {
    let (app, store) = create_test_app();

    let body = json!({ "title": "Groceries" });
    let (status, body) = send(&app, "POST", "/items", None, Some(body)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert!(store.is_empty().await);
}

#[tokio::test]
#[traced_test]
async fn test_create_with_token_stores_keyed_record() {
    let (app, store) = create_test_app();
    let token = id_token("sub-123");

    let (status, body) = send(
        &app,
        "POST",
        "/items",
        Some(&token),
        Some(json!({ "title": "Groceries" })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let list_id = body["listID"].as_str().unwrap();
    let keys = store.keys().await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].pk, "USER#sub-123");
    assert_eq!(keys[0].sk, format!("LIST#{list_id}"));
}

#[tokio::test]
async fn test_invalid_tokens_are_rejected() {
    let (app, store) = create_test_app();

    let access_token = encode(
        &Header::default(),
        &json!({
            "sub": "sub-123",
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "token_use": "access",
            "exp": OffsetDateTime::now_utc().unix_timestamp() + 3600,
        }),
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap();

    for token in ["garbage", access_token.as_str()] {
        let body = json!({ "title": "x" });
        let (status, _) = send(&app, "POST", "/items", Some(token), Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{token}");
    }
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_full_list_lifecycle() {
    let (app, store) = create_test_app();
    let token = id_token("sub-123");
    let token = Some(token.as_str());

    let (status, created) = send(
        &app,
        "POST",
        "/items",
        token,
        Some(json!({ "title": "Weekend", "tasks": [{ "title": "Hike" }, { "title": "Read" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let list_id = created["listID"].as_str().unwrap().to_string();
    let task_id = created["tasks"][0]["taskID"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/items/{list_id}/{task_id}/status"),
        token,
        Some(json!({ "status": "done" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, list) = send(&app, "GET", &format!("/items/{list_id}"), token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["tasks"][0]["status"], "done");
    assert_eq!(list["tasks"][1]["status"], "open");

    let (status, lists) = send(&app, "GET", "/items", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lists.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", &format!("/items/{list_id}"), token, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.is_empty().await);

    let (status, body) = send(&app, "GET", &format!("/items/{list_id}"), token, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_other_users_cannot_see_lists() {
    let (app, _) = create_test_app();
    let alice = id_token("alice");
    let bob = id_token("bob");

    let body = json!({ "title": "Private" });
    let (_, created) = send(&app, "POST", "/items", Some(&alice), Some(body)).await;
    let list_id = created["listID"].as_str().unwrap();

    let (status, _) = send(&app, "GET", &format!("/items/{list_id}"), Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (app, _) = create_test_app();
    let token = id_token("sub-123");

    let request = Request::builder()
        .method("POST")
        .uri("/items")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_preflight_does_not_need_a_token() {
    let (app, _) = create_test_app();

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/items")
        .header("Origin", "https://app.example.com")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "authorization,content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert!(response.status().is_success());
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-max-age"], "864000");
}

#[tokio::test]
async fn test_health_is_public() {
    let (app, _) = create_test_app();
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _) = create_test_app();
    let token = id_token("sub-123");
    let (status, _) = send(&app, "GET", "/lists", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_path_parameters_are_percent_decoded() {
    let (app, store) = create_test_app();
    let token = id_token("sub-123");

    let (status, body) = send(&app, "GET", "/items/a%20b", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"]["message"].as_str().unwrap().contains("a b"), "{body}");

    let (status, _) = send(&app, "DELETE", "/items/x%23TASK%23y", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(store.is_empty().await);
}
