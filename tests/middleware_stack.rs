//! Integration tests for the full middleware stack.
//!
//! Most tests drive the router in-process with `tower::ServiceExt::oneshot`.
//! The last one serves it on a loopback port and talks to it over HTTP.
//!
//! Run with: `cargo test --test middleware_stack`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::routing::get;
use serde_json::Value;
use tower::ServiceExt;

use request_guards::middleware::RateLimitLayer;
use request_guards::{AppState, Config, apply_middleware, build_router};

/// Config with the limiter and metrics out of the way.
fn test_config() -> Config {
    Config {
        rate_limit_rps: 0.0,
        metrics_port: 0,
        ..Config::default()
    }
}

fn app(config: Config) -> Router {
    build_router(AppState::new(config).unwrap())
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// =============================================================================
// Deadline
// =============================================================================

#[tokio::test]
async fn test_fast_request_completes_under_deadline() {
    let app = app(Config {
        request_timeout: Duration::from_millis(200),
        ..test_config()
    });

    let response = app.oneshot(get_req("/delay/10")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    let body = body_json(response).await;
    assert_eq!(body["completed"], true);
}

#[tokio::test]
async fn test_slow_request_gets_gateway_timeout() {
    let app = app(Config {
        request_timeout: Duration::from_millis(50),
        ..test_config()
    });

    let response = app.oneshot(get_req("/delay/500")).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    // Outer layers still decorate the 504
    assert!(response.headers().contains_key("x-request-id"));
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_exempt_prefix_runs_without_deadline() {
    let app = app(Config {
        request_timeout: Duration::from_millis(20),
        timeout_exempt_paths: vec!["/delay".to_string()],
        ..test_config()
    });

    let response = app.oneshot(get_req("/delay/100")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["completed"], true);
}

#[tokio::test]
async fn test_zero_timeout_disables_deadline() {
    let app = app(Config {
        request_timeout: Duration::ZERO,
        ..test_config()
    });

    let response = app.oneshot(get_req("/delay/60")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Request ID, echo and access log body restore
// =============================================================================

#[tokio::test]
async fn test_request_id_propagated_to_handler_and_response() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo?debug=1")
                .header("x-request-id", "trace-123")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "trace-123");

    let body = body_json(response).await;
    assert_eq!(body["request_id"], "trace-123");
    assert_eq!(body["query"], "debug=1");
    // Access log read the body and handed it on intact
    assert_eq!(body["body"], "payload");
}

#[tokio::test]
async fn test_request_id_generated_when_missing() {
    let response = app(test_config())
        .oneshot(get_req("/health"))
        .await
        .unwrap();

    let id = response.headers()["x-request-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_after_burst() {
    let app = app(Config {
        rate_limit_rps: 1.0,
        rate_limit_burst: 1,
        ..test_config()
    });

    let from = |ip: &str| {
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(from("198.51.100.1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(from("198.51.100.1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    assert!(second.headers().contains_key("x-request-id"));

    let other = app.clone().oneshot(from("198.51.100.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

// =============================================================================
// CORS
// =============================================================================

#[tokio::test]
async fn test_cors_preflight_answered() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/echo")
                .header(header::ORIGIN, "https://app.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_cors_restricted_origin() {
    let app = app(Config {
        cors_allowed_origins: vec!["https://app.example.com".to_string()],
        ..test_config()
    });

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "https://evil.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}

// =============================================================================
// Body limit
// =============================================================================

#[tokio::test]
async fn test_declared_oversized_body_rejected() {
    let size = 2 * 1024 * 1024;
    let response = app(Config {
        max_request_body_mb: 1,
        ..test_config()
    })
    .oneshot(
        Request::builder()
            .method("POST")
            .uri("/echo")
            .header(header::CONTENT_LENGTH, size)
            .body(Body::from(vec![b'a'; size]))
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_undeclared_oversized_body_rejected_while_read() {
    let response = app(Config {
        max_request_body_mb: 1,
        ..test_config()
    })
    .oneshot(
        Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Body::from(vec![b'a'; 2 * 1024 * 1024]))
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["error"], "payload_too_large");
}

// =============================================================================
// Panic recovery
// =============================================================================

async fn explode() -> &'static str {
    panic!("handler exploded")
}

#[tokio::test]
async fn test_panic_under_deadline_becomes_500() {
    let config = Config {
        request_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let app = apply_middleware(Router::new().route("/boom", get(explode)), &config, None);

    let response = app.oneshot(get_req("/boom")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], "internal_error");
    assert!(!body["message"].as_str().unwrap().contains("exploded"));
}

#[tokio::test]
async fn test_shared_rate_limiter_across_routers() {
    let config = test_config();
    let limiter = RateLimitLayer::new(1.0, 1).unwrap();
    let routes = || Router::new().route("/", get(|| async { "ok" }));

    let a = apply_middleware(routes(), &config, Some(limiter.clone()));
    let b = apply_middleware(routes(), &config, Some(limiter.clone()));

    assert_eq!(a.oneshot(get_req("/")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        b.oneshot(get_req("/")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(limiter.tracked_clients(), 1);
}

// =============================================================================
// Real server
// =============================================================================

#[tokio::test]
async fn test_served_over_tcp_with_peer_address() {
    let app = app(Config {
        request_timeout: Duration::from_millis(100),
        ..test_config()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    let echo = client
        .post(format!("{base}/echo"))
        .body("over the wire")
        .send()
        .await
        .unwrap();
    let body: Value = echo.json().await.unwrap();
    assert_eq!(body["body"], "over the wire");

    let slow = client
        .get(format!("{base}/delay/1000"))
        .send()
        .await
        .unwrap();
    assert_eq!(slow.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    assert!(slow.bytes().await.unwrap().is_empty());

    server.abort();
}
