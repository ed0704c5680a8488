//! Shared application state for Axum handlers.
//!
//! Holds the configuration, the shared rate limiter and the background
//! housekeeping task that prunes it.
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::middleware::{RateLimitError, RateLimitLayer};

/// How often idle rate limiter keys are dropped.
pub const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// state.spawn_housekeeping();
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Application configuration
    pub config: Arc<Config>,
    /// Per-IP limiter shared by every clone of the layer, `None` when disabled
    pub rate_limiter: Option<RateLimitLayer>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if the configured rate cannot build a limiter.
    pub fn new(config: Config) -> Result<Self, RateLimitError> {
        // NaN compares false against zero and would read as "disabled"
        let rps = config.rate_limit_rps;
        if !rps.is_finite() || rps < 0.0 {
            return Err(RateLimitError::InvalidRate(rps));
        }

        let rate_limiter = if config.rate_limiting_enabled() {
            Some(RateLimitLayer::with_trusted_proxies(
                config.rate_limit_rps,
                config.rate_limit_burst,
                &config.trusted_proxies,
            )?)
        } else {
            None
        };

        Ok(Self {
            started_at: Instant::now(),
            config: Arc::new(config),
            rate_limiter,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Get uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Start the limiter pruning task. No-op when rate limiting is disabled.
    pub fn spawn_housekeeping(&self) {
        self.spawn_housekeeping_every(RATE_LIMIT_PRUNE_INTERVAL);
    }

    fn spawn_housekeeping_every(&self, period: Duration) {
        let Some(limiter) = self.rate_limiter.clone() else {
            return;
        };
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Rate limiter housekeeping stopped");
                        break;
                    }
                    _ = ticker.tick() => limiter.prune(),
                }
            }
        });
    }

    /// Signal background tasks to stop and wait for them.
    pub async fn shutdown(&self) {
        info!("Shutting down background tasks...");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("Background tasks stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_follows_config() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(state.rate_limiter.is_some());

        let state = AppState::new(Config {
            rate_limit_rps: 0.0,
            ..Config::default()
        })
        .unwrap();
        assert!(state.rate_limiter.is_none());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        for rps in [f64::NAN, f64::INFINITY, -1.0] {
            let result = AppState::new(Config {
                rate_limit_rps: rps,
                ..Config::default()
            });
            assert!(
                matches!(result, Err(RateLimitError::InvalidRate(_))),
                "rps={rps}"
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks() {
        let state = AppState::new(Config::default()).unwrap();
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_housekeeping_prunes_until_shutdown() {
        let state = AppState::new(Config {
            rate_limit_rps: 1000.0,
            rate_limit_burst: 1,
            ..Config::default()
        })
        .unwrap();
        let limiter = state.rate_limiter.clone().unwrap();

        state.spawn_housekeeping_every(Duration::from_millis(20));

        let app = axum::Router::new()
            .route("/", axum::routing::get(|| async { "ok" }))
            .layer(limiter.clone());
        let req = axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "192.0.2.10")
            .body(axum::body::Body::empty())
            .unwrap();
        tower::ServiceExt::oneshot(app, req).await.unwrap();
        assert_eq!(limiter.tracked_clients(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        tokio::time::timeout(Duration::from_secs(1), state.shutdown())
            .await
            .unwrap();
    }
}
