//! Per-client rate limiting.
//!
//! # Algorithm
//!
//! Uses the Governor crate's Generic Cell Rate Algorithm (GCRA), keyed by
//! client IP. The TCP peer address wins unless it is a trusted proxy (see
//! [`super::ip::extract_peer_ip_with_validation`]), so rotating
//! `X-Forwarded-For` does not buy a fresh bucket.
//!
//! Rates may be fractional: `0.5` admits one request every two seconds, with
//! `burst` extra cells of headroom.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next request will be accepted
//! - `X-RateLimit-Limit`: Configured rate per second
//! - `X-RateLimit-Remaining`: Always `0`
//!
//! # Housekeeping
//!
//! Keys are retained until [`RateLimitLayer::prune`] drops the ones whose
//! state has fully replenished. Call it periodically.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{TrustedProxyConfig, extract_peer_ip_with_validation};
use crate::metrics;

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitError {
    /// Rate must be a finite number greater than zero.
    InvalidRate(f64),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::InvalidRate(rate) => write!(
                f,
                "rate must be a finite value greater than 0 (got {rate}); omit the layer to disable limiting"
            ),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Per-IP limiter with the default DashMap-based state store.
type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(100.0, 50)?; // 100 RPS per IP, 50 burst
/// let app = Router::new().route("/api", get(handler)).layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<KeyedLimiter>,
    /// Configured rate (for headers)
    rate: f64,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    /// Create a per-IP limiter admitting `rate` requests per second plus `burst`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::InvalidRate` if `rate` is not finite and positive.
    pub fn new(rate: f64, burst: u32) -> Result<Self, RateLimitError> {
        Self::with_trusted_proxies(rate, burst, &[])
    }

    /// Like [`RateLimitLayer::new`], honoring forwarding headers only from `trusted_proxies`.
    pub fn with_trusted_proxies(
        rate: f64,
        burst: u32,
        trusted_proxies: &[String],
    ) -> Result<Self, RateLimitError> {
        let quota = quota_for(rate, burst)?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            rate,
            trusted_proxies: Arc::new(TrustedProxyConfig::new(trusted_proxies)),
        })
    }

    /// Drop limiter state for clients that are back to a full bucket.
    pub fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            before,
            after = self.limiter.len(),
            "Pruned idle rate limiter keys"
        );
    }

    /// Number of client keys currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

/// Build the GCRA quota: one cell every `1/rate` seconds, `burst` cells of headroom.
fn quota_for(rate: f64, burst: u32) -> Result<Quota, RateLimitError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(RateLimitError::InvalidRate(rate));
    }

    const MIN_BURST: NonZeroU32 = NonZeroU32::MIN;
    let burst = NonZeroU32::new(burst).unwrap_or(MIN_BURST);

    let period =
        Duration::try_from_secs_f64(1.0 / rate).map_err(|_| RateLimitError::InvalidRate(rate))?;
    let quota = Quota::with_period(period).ok_or(RateLimitError::InvalidRate(rate))?;

    Ok(quota.allow_burst(burst))
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            rate: self.rate,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<KeyedLimiter>,
    rate: f64,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client_ip = extract_peer_ip_with_validation(&req, &self.trusted_proxies).into_owned();

        match self.limiter.check_key(&client_ip) {
            Ok(()) => {
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait_time.as_secs().max(1);

                warn!(
                    client_ip = %client_ip,
                    path = %req.uri().path(),
                    retry_after_secs = retry_after,
                    "Rate limit exceeded for IP"
                );
                metrics::record_rate_limited();

                let response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    [
                        ("Retry-After", retry_after.to_string()),
                        ("X-RateLimit-Limit", self.rate.to_string()),
                        ("X-RateLimit-Remaining", "0".to_string()),
                    ],
                    "Rate limit exceeded. Please retry later.",
                )
                    .into_response();

                Box::pin(async move { Ok(response) })
            }
        }
    }
}
