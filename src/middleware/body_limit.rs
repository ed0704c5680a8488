//! Request body size limit.
//!
//! Thin configuration wrapper over tower-http's `RequestBodyLimitLayer`: the
//! limit is given in MiB and `0` disables it. Requests declaring a larger
//! `Content-Length` are answered with 413 before reaching the handler; streamed
//! bodies fail with a length-limit error when read past the limit.
//!
//! Axum's extractors carry their own `DefaultBodyLimit` (2 MB), so
//! [`apply_body_limit`] sets both to the same value.

use std::error::Error as StdError;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use http_body_util::LengthLimitError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

const BYTES_PER_MIB: usize = 1024 * 1024;

/// Convert a MiB setting to bytes, saturating on overflow.
pub fn mib_to_bytes(mib: usize) -> usize {
    mib.saturating_mul(BYTES_PER_MIB)
}

/// Build the body limit layer, or `None` when `max_mib` is zero.
pub fn request_body_limit(max_mib: usize) -> Option<RequestBodyLimitLayer> {
    if max_mib == 0 {
        info!("Request body size limit disabled");
        return None;
    }

    info!(max_size_mb = max_mib, "Request body size limit configured");
    Some(RequestBodyLimitLayer::new(mib_to_bytes(max_mib)))
}

/// Apply the body limit (or lift axum's default one) to a router.
pub fn apply_body_limit<S>(router: Router<S>, max_mib: usize) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    match request_body_limit(max_mib) {
        Some(layer) => router
            .layer(DefaultBodyLimit::max(mib_to_bytes(max_mib)))
            .layer(layer),
        None => router.layer(DefaultBodyLimit::disable()),
    }
}

/// Whether a body read error was caused by the size limit.
pub fn is_length_limit_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
