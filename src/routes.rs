//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Recover      │ ← 500 if a handler panics
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 if too large
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Access Log     │ ← One record per request
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers, preflight
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Deadline      │ ← 504 if too slow
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Health check (not access logged)
//! - `POST /echo` - Echo the request
//! - `GET /delay/{ms}` - Wait, honoring the request deadline

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::config::Config;
use crate::handlers;
use crate::middleware::{
    AccessLogLayer, DeadlineLayer, RateLimitLayer, RequestIdLayer, apply_body_limit,
    build_cors_layer, recover_layer,
};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/echo", post(handlers::echo))
        .route("/delay/{ms}", get(handlers::delay))
        .with_state(state.clone());

    apply_middleware(router, &state.config, state.rate_limiter.clone())
}

/// Wrap `router` in the full middleware stack.
///
/// `rate_limiter` is passed in rather than built here so the caller can keep
/// a handle for housekeeping; `None` disables rate limiting.
pub fn apply_middleware(
    router: Router,
    config: &Config,
    rate_limiter: Option<RateLimitLayer>,
) -> Router {
    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Deadline guard
    let mut router = if config.deadline_enabled() {
        info!(
            timeout_ms = u64::try_from(config.request_timeout.as_millis()).unwrap_or(u64::MAX),
            exempt_paths = ?config.timeout_exempt_paths,
            "Request deadline enabled"
        );
        router.layer(DeadlineLayer::new(config.deadline_config()))
    } else {
        info!("Request deadline disabled (REQUEST_TIMEOUT_MS=0)");
        router
    };

    // 2. Rate limiting (if enabled)
    match rate_limiter {
        Some(layer) => {
            info!(
                rps = config.rate_limit_rps,
                burst = config.rate_limit_burst,
                proxy_validation = config.proxy_validation_enabled(),
                trusted_proxies = config.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            router = router.layer(layer);
        }
        None => info!("Rate limiting disabled (RATE_LIMIT_RPS=0)"),
    }

    // 3. CORS
    router = router.layer(build_cors_layer(&config.cors_config()));

    // 4. Access log
    router = router.layer(AccessLogLayer::new(config.access_log_config()));

    // 5. Request body size limit
    router = apply_body_limit(router, config.max_request_body_mb);

    // 6. Request ID
    router = router.layer(RequestIdLayer::new());

    // 7. Panic recovery (outermost)
    router.layer(recover_layer())
}
