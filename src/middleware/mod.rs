//! HTTP middleware: deadlines, rate limiting, and observability.
//!
//! - **Deadline**: runs the handler on a worker task and answers 504 when it
//!   misses its deadline
//! - **Rate Limiting**: per-IP GCRA with fractional rates and burst
//! - **Body Limit**: 413 for oversized request bodies
//! - **CORS**: configurable origins, methods and headers
//! - **Access Log**: one structured event per request
//! - **Request ID**: generation and propagation for tracing
//! - **Recover**: handler panics become 500 responses
//!
//! # Architecture
//!
//! ```text
//! Request → Recover → Request ID → Body Limit → Access Log → CORS → Rate Limiter → Deadline → Handler
//!              ↓           ↓            ↓                              ↓              ↓
//!             500    X-Request-Id      413                            429            504
//! ```
//!
//! Layers earlier in the chain see the responses produced by the later ones,
//! so a 429 or 504 is still logged and still carries a request ID.

pub mod access_log;
pub mod body_limit;
pub mod buffer_pool;
pub mod cors;
pub mod deadline;
pub mod ip;
pub mod rate_limit;
pub mod recover;
pub mod request_id;

pub use access_log::{AccessLogConfig, AccessLogLayer, AuthIdentity};
pub use body_limit::{apply_body_limit, request_body_limit};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use cors::{CorsConfig, build_cors_layer};
pub use deadline::{DeadlineConfig, DeadlineLayer, RequestDeadline, RequestDeadlineExt};
pub use ip::{
    TrustedProxyConfig, UNKNOWN_IP, extract_client_ip, extract_client_ip_with_validation,
    extract_peer_ip_with_validation,
};
pub use rate_limit::{RateLimitError, RateLimitLayer};
pub use recover::recover_layer;
pub use request_id::{RequestId, RequestIdExt, RequestIdLayer};
