//! Deadline-guarded request execution.
//!
//! Wraps the rest of the chain with a server-side deadline. The continuation
//! runs on its own task and writes into a pooled buffer; the supervisor races
//! that task against the deadline and answers exactly once:
//!
//! ```text
//!                  ┌──────────── worker task ─────────────┐
//! Request ──► spawn│ inner.oneshot(req) → buffer body     │
//!    │             └──────────────────┬───────────────────┘
//!    │                                │ JoinHandle
//!    ▼                                ▼
//! select! { deadline ──► 504, empty body (worker detached)
//!           finished ──► buffered status + headers + body }
//! ```
//!
//! # Cancellation
//!
//! Each guarded request gets a [`RequestDeadline`] extension. Its token is
//! cancelled on every exit path of the supervisor, so handlers that want to
//! stop early can await [`RequestDeadline::cancelled`]. Nothing is aborted
//! forcibly: a timed-out handler may run to completion in the background.
//!
//! # Buffer ownership
//!
//! The response buffer moves into the worker and comes back only through the
//! join output. On timeout the worker keeps it; when the worker ends the
//! buffer drops back into the pool. The supervisor never touches a buffer
//! that might still be written.
//!
//! # Disabled paths
//!
//! A zero timeout, or a path starting with one of the exempt prefixes, calls
//! the inner service directly before anything is allocated.

use std::panic;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, warn};

use super::buffer_pool::{BufferPool, DEFAULT_MAX_IDLE, PooledBuffer};
use crate::metrics;

/// Upper bound for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline guard configuration.
#[derive(Debug, Clone, Default)]
pub struct DeadlineConfig {
    /// Maximum time a request may take. `Duration::ZERO` disables the guard.
    pub timeout: Duration,
    /// Path prefixes that are never guarded (streaming, uploads, websockets...).
    pub exempt_prefixes: Vec<String>,
}

impl DeadlineConfig {
    pub fn new(timeout: Duration, exempt_prefixes: Vec<String>) -> Self {
        Self {
            timeout,
            exempt_prefixes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Prefix match against the request path.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Deadline-bound context attached to a guarded request.
///
/// Extract it in handlers with `Extension<RequestDeadline>`.
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    deadline: Instant,
    token: CancellationToken,
}

impl RequestDeadline {
    /// Derive a context from an optional outer one.
    ///
    /// A nested guard never extends its parent: the earlier deadline wins and
    /// cancelling the parent cancels the child.
    fn derive(parent: Option<&RequestDeadline>, timeout: Duration) -> Self {
        let now = Instant::now();
        let own = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        match parent {
            Some(parent) => Self {
                deadline: own.min(parent.deadline),
                token: parent.token.child_token(),
            },
            None => Self {
                deadline: own,
                token: CancellationToken::new(),
            },
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the guard has finished with this request.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Extension trait for reading the deadline context off a request.
pub trait RequestDeadlineExt {
    fn request_deadline(&self) -> Option<&RequestDeadline>;
}

impl<B> RequestDeadlineExt for Request<B> {
    fn request_deadline(&self) -> Option<&RequestDeadline> {
        self.extensions().get::<RequestDeadline>()
    }
}

/// Deadline guard layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let guard = DeadlineLayer::new(DeadlineConfig::new(
///     Duration::from_secs(30),
///     vec!["/upload".to_string()],
/// ));
/// let app = Router::new().route("/api", get(handler)).layer(guard);
/// ```
#[derive(Clone)]
pub struct DeadlineLayer {
    config: Arc<DeadlineConfig>,
    pool: Arc<BufferPool>,
}

impl DeadlineLayer {
    pub fn new(config: DeadlineConfig) -> Self {
        Self::with_pool(config, BufferPool::new(DEFAULT_MAX_IDLE))
    }

    /// Create a layer that captures response bodies into `pool`.
    pub fn with_pool(config: DeadlineConfig, pool: Arc<BufferPool>) -> Self {
        Self {
            config: Arc::new(config),
            pool,
        }
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            config: self.config.clone(),
            pool: self.pool.clone(),
        }
    }
}

/// Deadline guard service wrapper.
#[derive(Clone)]
pub struct DeadlineService<S> {
    inner: S,
    config: Arc<DeadlineConfig>,
    pool: Arc<BufferPool>,
}

impl<S> Service<Request<Body>> for DeadlineService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
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
        // Take the service that was driven to readiness, leave a clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.config.is_enabled() || self.config.is_exempt(req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let timeout = self.config.timeout;
        let deadline = RequestDeadline::derive(req.request_deadline(), timeout);
        req.extensions_mut().insert(deadline.clone());

        let path = req.uri().path().to_owned();
        let buffer = self.pool.acquire();

        Box::pin(async move {
            // Cancels the derived context however this future ends
            let _cancel_on_exit = deadline.token().clone().drop_guard();

            let mut worker = tokio::spawn(run_buffered(inner, req, buffer));

            tokio::select! {
                biased;

                joined = &mut worker => match joined {
                    Ok(Ok(buffered)) => Ok(buffered.into_response()),
                    Ok(Err(e)) => Err(e),
                    Err(join_error) if join_error.is_panic() => {
                        panic::resume_unwind(join_error.into_panic())
                    }
                    Err(join_error) => {
                        error!(path = %path, error = %join_error, "Guarded request worker was cancelled");
                        Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                    }
                },

                () = tokio::time::sleep_until(deadline.deadline()) => {
                    warn!(
                        path = %path,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Request exceeded deadline"
                    );
                    metrics::record_request_timed_out();
                    // Dropping the JoinHandle detaches the worker; its buffer
                    // goes back to the pool when it finishes.
                    drop(worker);
                    Ok(StatusCode::GATEWAY_TIMEOUT.into_response())
                }
            }
        })
    }
}

/// Continuation output captured off the transport.
struct BufferedResponse {
    parts: axum::http::response::Parts,
    body: PooledBuffer,
}

impl BufferedResponse {
    /// Copy the captured bytes into a real response and release the buffer.
    fn into_response(self) -> Response<Body> {
        let body = Bytes::copy_from_slice(&self.body);
        Response::from_parts(self.parts, Body::from(body))
    }
}

/// Worker body: run the continuation and drain its response into `buffer`.
async fn run_buffered<S>(
    inner: S,
    req: Request<Body>,
    mut buffer: PooledBuffer,
) -> Result<BufferedResponse, S::Error>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    let response = inner.oneshot(req).await?;
    let (parts, body) = response.into_parts();

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(&bytes),
            Err(e) => {
                error!(error = %e, "Failed to buffer response body");
                buffer.clear();
                let (parts, _) = StatusCode::INTERNAL_SERVER_ERROR
                    .into_response()
                    .into_parts();
                return Ok(BufferedResponse {
                    parts,
                    body: buffer,
                });
            }
        }
    }

    debug!(bytes = buffer.len(), "Guarded request completed");
    Ok(BufferedResponse {
        parts,
        body: buffer,
    })
}
