//! CORS layer built from explicit configuration.
//!
//! Every list accepts `*` for "anything". Browsers refuse wildcard answers on
//! credentialed requests, so with `allow_credentials` the wildcards are
//! mirrored from the request instead, and a wildcard expose list is dropped.
//!
//! Entries that don't parse as an origin, method or header name are logged
//! and skipped.

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer, ExposeHeaders};
use tracing::warn;

const WILDCARD: &str = "*";

/// CORS settings.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    /// How long browsers may cache preflight answers.
    pub max_age: Option<Duration>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![WILDCARD.to_string()],
            allowed_methods: vec![WILDCARD.to_string()],
            allowed_headers: vec![WILDCARD.to_string()],
            expose_headers: vec![WILDCARD.to_string()],
            allow_credentials: false,
            max_age: None,
        }
    }
}

fn is_wildcard(values: &[String]) -> bool {
    values.iter().any(|v| v == WILDCARD)
}

/// Parse every entry with `parse`, logging the ones that fail.
fn parse_all<T>(kind: &str, values: &[String], parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    values
        .iter()
        .filter_map(|value| {
            let parsed = parse(value);
            if parsed.is_none() {
                warn!(kind, value = %value, "Invalid CORS entry, skipping");
            }
            parsed
        })
        .collect()
}

/// Build a `CorsLayer` from configuration.
pub fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    let credentials = config.allow_credentials;

    let origin = if is_wildcard(&config.allowed_origins) {
        if credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::from(Any)
        }
    } else {
        AllowOrigin::list(parse_all("origin", &config.allowed_origins, |o| {
            HeaderValue::from_str(o).ok()
        }))
    };

    let methods = if is_wildcard(&config.allowed_methods) {
        if credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::from(Any)
        }
    } else {
        AllowMethods::list(parse_all("method", &config.allowed_methods, |m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok()
        }))
    };

    let headers = if is_wildcard(&config.allowed_headers) {
        if credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::from(Any)
        }
    } else {
        AllowHeaders::list(parse_all("header", &config.allowed_headers, |h| {
            HeaderName::from_bytes(h.as_bytes()).ok()
        }))
    };

    let expose = if is_wildcard(&config.expose_headers) {
        if credentials {
            warn!("Wildcard CORS expose headers cannot be combined with credentials, ignoring");
            ExposeHeaders::list(Vec::<HeaderName>::new())
        } else {
            ExposeHeaders::from(Any)
        }
    } else {
        ExposeHeaders::list(parse_all("expose header", &config.expose_headers, |h| {
            HeaderName::from_bytes(h.as_bytes()).ok()
        }))
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(expose)
        .allow_credentials(credentials);

    if let Some(max_age) = config.max_age {
        layer = layer.max_age(max_age);
    }

    layer
}
