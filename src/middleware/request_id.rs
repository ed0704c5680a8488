//! Request ID middleware for distributed tracing.
//!
//! # Features
//!
//! - Reuses a well-formed incoming `X-Request-Id`
//! - Generates a UUIDv4 when the header is missing or malformed
//! - Stores the ID as a [`RequestId`] extension and in the request headers
//! - Adds `X-Request-Id` to every response
//!
//! # Client Usage
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:3000/echo
//! ```
//!
//! The same ID will be returned in the response for correlation.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Incoming IDs longer than this are replaced.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Request identifier stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let (request_id, header_value) = extract_or_generate_request_id(&req);

        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.extensions_mut().insert(request_id.clone());

        Span::current().record("request_id", request_id.as_str());
        debug!(request_id = %request_id, "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        })
    }
}

/// Reuse the incoming ID when acceptable, otherwise mint a UUIDv4.
///
/// Returns the header value alongside so it is validated only once.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> (RequestId, HeaderValue) {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && is_acceptable_id(value)
    {
        return (RequestId(Arc::from(value)), header_value.clone());
    }

    let generated = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value
    let header_value = HeaderValue::from_str(&generated)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (RequestId(Arc::from(generated)), header_value)
}

fn is_acceptable_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

/// Extension trait to read the request ID off a request.
pub trait RequestIdExt {
    /// Extension first, then the raw header.
    fn request_id(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        if let Some(id) = self.extensions().get::<RequestId>() {
            return Some(id.to_string());
        }
        self.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}
