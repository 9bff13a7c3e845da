//! HTTP round-trips against a real local server.
//!
//! Each test starts an Axum server on a random port and talks to it through
//! the default reqwest-backed connection.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use prism_transport::{
    Method, RequestBody, RequestOptions, RequestParams, Transport, TransportConfig,
    TransportError,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;

/// Start a real HTTP server on a random port and return its address.
async fn start_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = Router::new()
        .route("/", get(|| async { Json(json!({"tagline": "You Know, for Search"})) }))
        .route(
            "/echo",
            post(|headers: HeaderMap, body: String| async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                Json(json!({
                    "body": body,
                    "content_type": header("content-type"),
                    "authorization": header("authorization"),
                    "user_agent": header("user-agent"),
                }))
            }),
        )
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"found": false}))) }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        )
        .route(
            "/_nodes/_all/http",
            get(move || async move {
                Json(json!({
                    "nodes": {
                        "real-node": {
                            "http": {"publish_address": addr.to_string()},
                            "roles": ["master", "data", "ingest"]
                        }
                    }
                }))
            }),
        );

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, handle)
}

fn transport_for(url: &str) -> Transport {
    Transport::new(TransportConfig::with_nodes([url])).unwrap()
}

#[tokio::test]
async fn test_get_json() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://{}", addr));

    let response = transport
        .request(RequestParams::new(Method::GET, "/"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["tagline"], "You Know, for Search");
    assert!(response
        .headers
        .get("content-type")
        .is_some_and(|ct| ct.starts_with("application/json")));
}

#[tokio::test]
async fn test_post_json_body_and_headers() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://{}", addr));

    let response = transport
        .request(
            RequestParams::new(Method::POST, "/echo")
                .with_body(RequestBody::Json(json!({"query": {"match_all": {}}}))),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.body["body"], r#"{"query":{"match_all":{}}}"#);
    assert_eq!(response.body["content_type"], "application/json");
    assert!(response.body["user_agent"]
        .as_str()
        .unwrap()
        .starts_with("prism-transport/"));
}

#[tokio::test]
async fn test_url_credentials_sent_as_basic_auth() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://elastic:changeme@{}", addr));

    let response = transport
        .request(RequestParams::new(Method::POST, "/echo"), RequestOptions::default())
        .await
        .unwrap();

    // base64("elastic:changeme")
    assert_eq!(
        response.body["authorization"],
        "Basic ZWxhc3RpYzpjaGFuZ2VtZQ=="
    );
    let node = &transport.pool().nodes()[0];
    assert_eq!(node.url().username(), "");
}

#[tokio::test]
async fn test_head_and_not_found() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://{}", addr));

    let head = transport
        .request(RequestParams::new(Method::HEAD, "/"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(head.body, Value::Bool(true));

    let err = transport
        .request(RequestParams::new(Method::GET, "/missing"), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    // A 404 is a valid exchange, the node stays alive
    assert!(transport.pool().dead_ids().is_empty());
}

#[tokio::test]
async fn test_timeout_marks_node_dead() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://{}", addr));

    let err = transport
        .request(
            RequestParams::new(Method::GET, "/slow"),
            RequestOptions::default()
                .with_request_timeout(Duration::from_millis(100))
                .with_max_retries(0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)));
    assert_eq!(transport.pool().dead_ids().len(), 1);
}

#[tokio::test]
async fn test_sniff_against_server() {
    let (addr, _server) = start_server().await;
    let transport = transport_for(&format!("http://{}", addr));

    let ids = transport.sniff().await.unwrap();
    assert_eq!(ids, vec!["real-node".to_string()]);

    let node = transport.pool().node("real-node").unwrap();
    assert_eq!(node.url().port(), Some(addr.port()));

    let response = transport
        .request(RequestParams::new(Method::GET, "/"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.meta.node.unwrap().id(), "real-node");
}

#[tokio::test]
async fn test_unreachable_node() {
    // Bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = transport_for(&format!("http://{}", addr));
    let err = transport
        .request(
            RequestParams::new(Method::GET, "/"),
            RequestOptions::default().with_max_retries(1),
        )
        .await
        .unwrap_err();

    assert!(err.is_transport_failure());
    let node = &transport.pool().nodes()[0];
    assert_eq!(node.dead_count(), 2);
}
