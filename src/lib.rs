//! # Request Guards
//!
//! Tower middleware for Axum services that bound what a single request can
//! cost:
//!
//! - **Deadline**: handlers run on a worker task against a server-side
//!   deadline; late requests get 504 and their output is discarded
//! - **Rate Limiting**: per-IP GCRA with fractional rates
//! - **Body Limit**, **CORS**, **Panic Recovery**
//! - **Observability**: request IDs, structured access logs, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Recover → Request ID → Body Limit → Access Log → CORS      │
//! │          → Rate Limit → Deadline                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, echo, delay)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_guards::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Using the guard alone
//!
//! ```rust,ignore
//! use request_guards::middleware::{DeadlineConfig, DeadlineLayer};
//!
//! let app = Router::new()
//!     .route("/api", get(handler))
//!     .layer(DeadlineLayer::new(DeadlineConfig::new(
//!         Duration::from_secs(5),
//!         vec!["/events".to_string()],
//!     )));
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, LogFormat};
pub use error::{AppError, AppResult};
pub use routes::{apply_middleware, build_router};
pub use state::AppState;
