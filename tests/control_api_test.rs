//! Control-plane API Integration Tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use megaphone::domain::{CallQueue, CallSession, Session};
use megaphone::infrastructure::protocols::sip::{Proxy, ProxyConfig};
use megaphone::interface::api::{build_router, ApiState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot`

async fn setup() -> (Arc<CallQueue>, Router) {
    let queue = Arc::new(CallQueue::with_capacity(8));
    let proxy = Proxy::new(ProxyConfig::default(), queue.clone()).await;
    let app = build_router(ApiState {
        calls: proxy.calls().clone(),
    });
    (queue, app)
}

fn session(id: &str) -> Arc<CallSession> {
    Arc::new(CallSession::new(
        id,
        "sip:alice@host",
        "sip:queue@host",
        Some("tag".to_string()),
        "127.0.0.1:5060".parse().unwrap(),
    ))
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health() {
    let (_, app) = setup().await;
    let (status, json) = send(app, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"], "OK");
}

#[tokio::test]
async fn test_queue_snapshot() {
    let (queue, app) = setup().await;
    for id in ["a", "b", "c"] {
        queue.admit(session(id)).unwrap();
    }

    let (status, json) = send(app, "GET", "/queue").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["current"], "a");
    assert_eq!(json["data"]["waiting"], serde_json::json!(["b", "c"]));
    assert_eq!(json["data"]["max_waiting"], 8);
}

#[tokio::test]
async fn test_empty_queue() {
    let (_, app) = setup().await;
    let (status, json) = send(app, "GET", "/queue").await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["data"]["current"].is_null());
    assert_eq!(json["data"]["waiting"], serde_json::json!([]));
}

#[tokio::test]
async fn test_promote_next() {
    let (queue, app) = setup().await;
    queue.admit(session("a")).unwrap();
    queue.admit(session("b")).unwrap();

    let (status, json) = send(app.clone(), "POST", "/queue/promote").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["current"], "b");
    assert_eq!(json["data"]["previous"], "a");
    assert_eq!(queue.current().unwrap().id(), "b");

    let (status, json) = send(app, "POST", "/queue/promote").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
}
