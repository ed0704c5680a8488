//! Panic recovery.
//!
//! Built on tower-http's `CatchPanicLayer` with a handler that logs the panic
//! payload and answers with the crate's JSON error body. The payload is never
//! sent to the client.
//!
//! Install it outside the deadline guard: the guard re-raises worker panics in
//! the calling task, where this layer catches them.

use std::any::Any;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::error;

use crate::error::ErrorResponse;
use crate::metrics;

/// Signature of the panic handler used by [`recover_layer`].
pub type PanicHandler = fn(Box<dyn Any + Send + 'static>) -> Response<Body>;

/// Build the panic recovery layer.
pub fn recover_layer() -> CatchPanicLayer<PanicHandler> {
    CatchPanicLayer::custom(handle_panic as PanicHandler)
}

/// Turn a panic payload into a 500 response.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = panic_message(payload.as_ref());
    error!(panic = %detail, "Request handler panicked");
    metrics::record_panic_recovered();

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ErrorResponse::new(
            "internal_error",
            "An internal error occurred. Please contact support if the issue persists.",
        )),
    )
        .into_response()
}

/// Best-effort textual form of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::http::Request;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn explode() -> &'static str {
        panic!("secret internal state")
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");

        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");

        let s: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let app = Router::new()
            .route("/explode", get(explode))
            .layer(recover_layer());

        let response = app
            .oneshot(Request::builder().uri("/explode").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("internal_error"));
        assert!(!text.contains("secret internal state"));
    }

    #[tokio::test]
    async fn test_normal_response_passes_through() {
        let app = Router::new()
            .route("/fine", get(|| async { "fine" }))
            .layer(recover_layer());

        let response = app
            .oneshot(Request::builder().uri("/fine").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
