//! End-to-end HTTP tests driving the full axum router in-process, against a
//! tempdir-backed libsql backend. Mirrors the teacher's `traffic.rs`: no
//! socket is opened, requests go straight through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use broker::config::Config;
use broker::state::AppState;
use camino::Utf8PathBuf;
use http_body_util::BodyExt as _;
use queue_core::clock::{Clock, MockClock};
use serde_json::{json, Value};
use tower::ServiceExt as _;
use time::OffsetDateTime;

const PROJECT: &str = "acme";
const CLIENT_ID: &str = "3381af92-2b9e-11e3-b191-71861300734c";

async fn test_app() -> Router {
    let (app, _clock) = test_app_with_clock().await;
    app
}

async fn test_app_with_clock() -> (Router, MockClock) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = Utf8PathBuf::from_path_buf(dir.path().join("broker.sqlite")).expect("utf8 path");
    let log_path = Utf8PathBuf::from_path_buf(dir.path().join("broker.log")).expect("utf8 path");

    let mut config = Config::standard(log_path);
    config.control_backend = broker::config::BackendConfig::Libsql { path: db_path };

    // Keep the tempdir alive for the duration of the test by leaking it: the
    // directory is process-local scratch space, cleaned up by the OS on
    // process exit.
    std::mem::forget(dir);

    let clock = MockClock::new(OffsetDateTime::now_utc());
    let state = AppState::load_with_clock(&config, Arc::new(clock.clone()) as Arc<dyn Clock>)
        .await
        .expect("state should initialize");
    (broker::api::make_router(state), clock)
}

fn request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Project-ID", PROJECT)
        .header("Client-ID", CLIENT_ID)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn request_no_body(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Project-ID", PROJECT)
        .header("Client-ID", CLIENT_ID)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Intent: create a queue, then create it again.
/// Expectation: the first `PUT` creates (201), the second is a no-op (204).
/// Success criteria: status codes match the idempotent-PUT convention.
#[tokio::test(flavor = "current_thread")]
async fn put_queue_is_idempotent() {
    let app = test_app().await;

    let response = app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

/// Intent: post a message, then list it back (S1 in the source scenarios).
/// Expectation: the posted body round-trips verbatim and the listing
/// reports exactly one message with an href shaped like the message
/// resource convention.
#[tokio::test(flavor = "current_thread")]
async fn post_then_list_message() {
    let app = test_app().await;

    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/v1.1/queues/orders/messages",
            json!([{"body": {"order_id": 42}, "ttl": 3600}]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let posted = body_json(response).await;
    assert_eq!(posted["resources"].as_array().unwrap().len(), 1);

    let response = app
        .oneshot(request_no_body("GET", "/v1.1/queues/orders/messages"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listing = body_json(response).await;
    let messages = listing["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["body"]["order_id"], 42);
    assert!(messages[0]["href"].as_str().unwrap().starts_with("/v1.1/queues/orders/messages/"));
}

/// Intent: claim a message, then release the claim.
/// Expectation: the claim response carries the claimed message; after the
/// claim is deleted the message is visible again in an unclaimed listing.
#[tokio::test(flavor = "current_thread")]
async fn claim_then_release_restores_visibility() {
    let app = test_app().await;

    app.clone().oneshot(request("PUT", "/v1.1/queues/jobs", json!({}))).await.unwrap();
    app.clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/messages", json!([{"body": {"n": 1}, "ttl": 3600}])))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/claims", json!({"ttl": 300, "grace": 60})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let claim = body_json(response).await;
    let claim_id = claim["id"].as_str().unwrap().to_owned();
    assert_eq!(claim["messages"].as_array().unwrap().len(), 1);

    // While claimed, a default listing (claimed messages excluded) is empty.
    let response = app
        .clone()
        .oneshot(request_no_body("GET", "/v1.1/queues/jobs/messages"))
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert!(listing["messages"].as_array().unwrap().is_empty());

    let response = app
        .clone()
        .oneshot(request_no_body("DELETE", &format!("/v1.1/queues/jobs/claims/{claim_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request_no_body("GET", "/v1.1/queues/jobs/messages"))
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["messages"].as_array().unwrap().len(), 1);
}

/// Intent: read from a queue that was never created.
/// Expectation: the broker reports `404 Not Found`, not a 500 or an empty
/// listing.
#[tokio::test(flavor = "current_thread")]
async fn missing_queue_is_not_found() {
    let app = test_app().await;

    let response = app.oneshot(request_no_body("GET", "/v1.1/queues/ghost/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Intent: post a message with a ttl outside the configured range.
/// Expectation: rejected with `400 Bad Request` before anything is stored.
#[tokio::test(flavor = "current_thread")]
async fn message_ttl_out_of_range_is_rejected() {
    let app = test_app().await;

    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let response = app
        .oneshot(request(
            "POST",
            "/v1.1/queues/orders/messages",
            json!([{"body": {}, "ttl": 10}]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: bulk-get more ids than the configured ceiling allows.
/// Expectation: `400 Bad Request`, matching the bulk-limit invariant.
#[tokio::test(flavor = "current_thread")]
async fn bulk_get_over_limit_is_rejected() {
    let app = test_app().await;
    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let ids: Vec<String> = (0..21).map(|i| format!("id{i}")).collect();
    let uri = format!("/v1.1/queues/orders/messages?ids={}", ids.join(","));
    let response = app.oneshot(request_no_body("GET", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: list with a limit above the configured ceiling.
/// Expectation: `400 Bad Request`.
#[tokio::test(flavor = "current_thread")]
async fn list_limit_over_ceiling_is_rejected() {
    let app = test_app().await;
    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let response = app
        .oneshot(request_no_body("GET", "/v1.1/queues/orders/messages?limit=21"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: bulk-delete more ids than the configured ceiling allows.
/// Expectation: `400 Bad Request`.
#[tokio::test(flavor = "current_thread")]
async fn bulk_delete_over_limit_is_rejected() {
    let app = test_app().await;
    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let ids: Vec<String> = (0..21).map(|i| format!("id{i}")).collect();
    let uri = format!("/v1.1/queues/orders/messages?ids={}", ids.join(","));
    let response = app.oneshot(request_no_body("DELETE", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: send a non-UUID `Client-ID` header.
/// Expectation: `400 Bad Request` from the header extractor, before the
/// handler body runs.
#[tokio::test(flavor = "current_thread")]
async fn non_uuid_client_id_is_rejected() {
    let app = test_app().await;
    app.clone().oneshot(request("PUT", "/v1.1/queues/orders", json!({}))).await.unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/v1.1/queues/orders/messages")
        .header("X-Project-ID", PROJECT)
        .header("Client-ID", "not-a-uuid")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: create queues whose names sit exactly at and just past the
/// 64-character ceiling.
/// Expectation: 64 characters succeeds, 65 is rejected.
#[tokio::test(flavor = "current_thread")]
async fn queue_name_length_boundary() {
    let app = test_app().await;

    let name_64 = "q".repeat(64);
    let response = app
        .clone()
        .oneshot(request("PUT", &format!("/v1.1/queues/{name_64}"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let name_65 = "q".repeat(65);
    let response = app.oneshot(request("PUT", &format!("/v1.1/queues/{name_65}"), json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Intent: register a pool, fetch it back.
/// Expectation: the pool admin surface round-trips metadata independent of
/// the `X-Project-ID`/`Client-ID` tenant headers.
#[tokio::test(flavor = "current_thread")]
async fn pool_round_trips_through_admin_api() {
    let app = test_app().await;

    let request = Request::builder()
        .method("PUT")
        .uri("/v1.1/pools/secondary")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"uri": "libsql:///tmp/secondary.db", "weight": 2})).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::builder().method("GET").uri("/v1.1/pools/secondary").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let pool = body_json(response).await;
    assert_eq!(pool["weight"], 2);
}

/// Intent: claim a message with a short claim ttl, then advance the clock
/// past that ttl without ever releasing the claim.
/// Expectation: once the claim has expired the message is visible again in
/// a default (unclaimed) listing and can be claimed by a second claim.
#[tokio::test(flavor = "current_thread")]
async fn expired_claim_restores_visibility_and_is_reclaimable() {
    let (app, clock) = test_app_with_clock().await;

    app.clone().oneshot(request("PUT", "/v1.1/queues/jobs", json!({}))).await.unwrap();
    app.clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/messages", json!([{"body": {"n": 1}, "ttl": 3600}])))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/claims", json!({"ttl": 60, "grace": 60})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let claim = body_json(response).await;
    assert_eq!(claim["messages"].as_array().unwrap().len(), 1);

    // While the claim is live, a default listing is empty.
    let response = app
        .clone()
        .oneshot(request_no_body("GET", "/v1.1/queues/jobs/messages"))
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert!(listing["messages"].as_array().unwrap().is_empty());

    // Advance the clock past the claim's ttl, without ever deleting it.
    clock.advance(time::Duration::seconds(61));

    let response = app
        .clone()
        .oneshot(request_no_body("GET", "/v1.1/queues/jobs/messages"))
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["messages"].as_array().unwrap().len(), 1, "message should be visible once its claim expired");

    // A fresh claim should be able to pick it up again.
    let response = app
        .clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/claims", json!({"ttl": 300, "grace": 60})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let claim = body_json(response).await;
    assert_eq!(claim["messages"].as_array().unwrap().len(), 1, "expired claim should be re-claimable");
}

/// Intent: claim a subset of messages in a queue and check `stats` while
/// that claim is still live.
/// Expectation: `total` counts every unexpired message regardless of claim
/// state, `claimed` counts only messages under a live (non-expired) claim,
/// and `free = total - claimed`.
#[tokio::test(flavor = "current_thread")]
async fn stats_report_correct_counts_with_a_live_claim() {
    let app = test_app().await;

    app.clone().oneshot(request("PUT", "/v1.1/queues/jobs", json!({}))).await.unwrap();
    app.clone()
        .oneshot(request(
            "POST",
            "/v1.1/queues/jobs/messages",
            json!([{"body": {"n": 1}, "ttl": 3600}, {"body": {"n": 2}, "ttl": 3600}, {"body": {"n": 3}, "ttl": 3600}]),
        ))
        .await
        .unwrap();

    // Claim just one of the three messages.
    let response = app
        .clone()
        .oneshot(request("POST", "/v1.1/queues/jobs/claims?limit=1", json!({"ttl": 300, "grace": 60})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let claim = body_json(response).await;
    assert_eq!(claim["messages"].as_array().unwrap().len(), 1);

    let response = app.oneshot(request_no_body("GET", "/v1.1/queues/jobs/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["messages"]["total"], 3);
    assert_eq!(stats["messages"]["claimed"], 1);
    assert_eq!(stats["messages"]["free"], 2);
}
