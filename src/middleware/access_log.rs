//! Structured access logging.
//!
//! One log event per request, emitted after the response is produced:
//!
//! - `info` for successful responses, with the caller identity when an
//!   [`AuthIdentity`] is attached to the request or the response
//! - `warn` for status >= 400, with the response body as `error`
//!
//! # Captured Fields
//!
//! | Field | Source |
//! |---|---|
//! | `request_id` | [`RequestId`](super::request_id::RequestId) extension or `X-Request-Id` |
//! | `time_us` | request start, unix microseconds |
//! | `client_ip` | see [`super::ip`] |
//! | `browser`, `browser_version` | `User-Agent`, parsed with woothee |
//! | `client_version` | `X-Client-Version` |
//! | `param` | request body, or the raw query when the body is empty or multipart |
//! | `data` | response body |
//! | `latency_ms` | time spent in the inner service |
//!
//! `param` and `data` are cut to the configured number of characters and
//! suffixed with `...`.
//!
//! # Buffering
//!
//! Both bodies are read into memory so they can be logged and then handed on
//! unchanged. Streaming endpoints (SSE, large downloads) should be listed in
//! `skip_prefixes`. `/health` is never logged.

use std::borrow::Cow;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, header};
use axum::response::IntoResponse;
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{error, info, warn};

use super::body_limit::is_length_limit_error;
use super::ip::{TrustedProxyConfig, extract_client_ip_with_validation};
use super::request_id::RequestIdExt;
use crate::error::AppError;
use crate::metrics;

/// Path that is never logged.
pub const HEALTH_PATH: &str = "/health";

/// Header carrying the client application version.
pub const CLIENT_VERSION_HEADER: &str = "x-client-version";

const TRUNCATION_SUFFIX: &str = "...";

/// Browser name when the `User-Agent` is missing or unrecognized.
const UNKNOWN_BROWSER: &str = "UNKNOWN";

/// Access log settings.
#[derive(Debug, Clone)]
pub struct AccessLogConfig {
    /// Free-form tag added to every record (service name, deployment...).
    pub tag: String,
    /// Maximum characters of request parameters to log.
    pub max_param_chars: usize,
    /// Maximum characters of response body to log.
    pub max_response_chars: usize,
    /// Path prefixes that are not logged.
    pub skip_prefixes: Vec<String>,
    /// Proxies whose forwarding headers are believed (see [`super::ip`]).
    pub trusted_proxies: Vec<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            tag: env!("CARGO_PKG_NAME").to_string(),
            max_param_chars: 1000,
            max_response_chars: 1000,
            skip_prefixes: Vec::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl AccessLogConfig {
    pub fn is_skipped(&self, path: &str) -> bool {
        path == HEALTH_PATH
            || self
                .skip_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Caller identity logged with successful requests.
///
/// Auth middleware can attach it to the request; handlers can attach it to
/// the response with `Extension(AuthIdentity(..))`. The response wins.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity(pub serde_json::Value);

/// Access log layer for Tower middleware stack.
#[derive(Clone)]
pub struct AccessLogLayer {
    config: Arc<AccessLogConfig>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl AccessLogLayer {
    pub fn new(config: AccessLogConfig) -> Self {
        Self {
            trusted_proxies: Arc::new(TrustedProxyConfig::new(&config.trusted_proxies)),
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            config: self.config.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Access log service wrapper.
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    config: Arc<AccessLogConfig>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for AccessLogService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.config.is_skipped(req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let config = self.config.clone();
        let mut record = AccessRecord::from_request(&req, &config.tag, &self.trusted_proxies);

        Box::pin(async move {
            let request_auth = req.extensions().get::<AuthIdentity>().cloned();

            let (req, param) = match capture_params(req).await {
                Ok(captured) => captured,
                Err(rejection) => {
                    let response = rejection.into_response();
                    record.finish(response.status().as_u16(), Instant::now(), String::new());
                    record.emit(&config, None);
                    return Ok(response);
                }
            };
            record.param = param;

            // Latency covers the inner stack only, not reading the body
            let start = Instant::now();

            let response = inner.call(req).await?;
            let (response, data) = capture_response(response).await;

            let auth = response
                .extensions()
                .get::<AuthIdentity>()
                .or(request_auth.as_ref())
                .cloned();
            record.finish(response.status().as_u16(), start, data);
            record.emit(&config, auth.as_ref());

            Ok(response)
        })
    }
}

/// Everything logged about one request.
#[derive(Debug, Default)]
struct AccessRecord {
    tag: String,
    request_id: String,
    time_us: i64,
    method: String,
    path: String,
    client_ip: String,
    browser: String,
    browser_version: String,
    client_version: Option<String>,
    param: String,
    status: u16,
    latency_ms: u64,
    data: String,
}

impl AccessRecord {
    fn from_request<B>(req: &Request<B>, tag: &str, trusted_proxies: &TrustedProxyConfig) -> Self {
        let (browser, browser_version) = browser_of(req.headers());

        Self {
            tag: tag.to_string(),
            request_id: req.request_id().unwrap_or_default(),
            time_us: Utc::now().timestamp_micros(),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            client_ip: extract_client_ip_with_validation(req, trusted_proxies).into_owned(),
            browser,
            browser_version,
            client_version: header_str(req.headers(), CLIENT_VERSION_HEADER).map(str::to_string),
            ..Self::default()
        }
    }

    fn finish(&mut self, status: u16, start: Instant, data: String) {
        let elapsed = start.elapsed();
        self.status = status;
        self.latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.data = data;
        metrics::record_request_duration(&self.method, status, elapsed.as_secs_f64());
    }

    fn emit(&self, config: &AccessLogConfig, auth: Option<&AuthIdentity>) {
        let param = truncate_chars(&self.param, config.max_param_chars);
        let data = truncate_chars(&self.data, config.max_response_chars);

        if self.status >= 400 {
            warn!(
                tag = %self.tag,
                request_id = %self.request_id,
                time_us = self.time_us,
                method = %self.method,
                path = %self.path,
                status = self.status,
                client_ip = %self.client_ip,
                browser = %self.browser,
                browser_version = %self.browser_version,
                client_version = ?self.client_version,
                latency_ms = self.latency_ms,
                param = %param,
                error = %self.data,
                "request failed"
            );
        } else {
            let auth = auth.map(|identity| identity.0.to_string());
            info!(
                tag = %self.tag,
                request_id = %self.request_id,
                time_us = self.time_us,
                method = %self.method,
                path = %self.path,
                status = self.status,
                client_ip = %self.client_ip,
                browser = %self.browser,
                browser_version = %self.browser_version,
                client_version = ?self.client_version,
                latency_ms = self.latency_ms,
                param = %param,
                data = %data,
                auth = ?auth,
                "request completed"
            );
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Browser name and version from the `User-Agent` header.
fn browser_of(headers: &HeaderMap) -> (String, String) {
    let Some(user_agent) = header_str(headers, header::USER_AGENT.as_str()) else {
        return (UNKNOWN_BROWSER.to_string(), String::new());
    };

    match woothee::parser::Parser::new().parse(user_agent) {
        Some(result) => (result.name.to_string(), result.version.to_string()),
        None => (UNKNOWN_BROWSER.to_string(), String::new()),
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Read the request parameters and rebuild the request around the same body.
async fn capture_params(req: Request<Body>) -> Result<(Request<Body>, String), AppError> {
    let query = req.uri().query().unwrap_or_default().to_string();

    if is_multipart(req.headers()) {
        return Ok((req, format!("form query: {query}")));
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| {
            if is_length_limit_error(&e) {
                AppError::PayloadTooLarge("Request body exceeds the configured limit".to_string())
            } else {
                AppError::BadRequest("Failed to read request body".to_string())
            }
        })?;

    let param = if bytes.is_empty() {
        query
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    Ok((Request::from_parts(parts, Body::from(bytes)), param))
}

/// Read the response body for logging and rebuild the response around it.
async fn capture_response(response: Response<Body>) -> (Response<Body>, String) {
    let (parts, body) = response.into_parts();

    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let data = String::from_utf8_lossy(&bytes).into_owned();
            (Response::from_parts(parts, Body::from(bytes)), data)
        }
        Err(e) => {
            error!(error = %e, "Failed to read response body for access log");
            let response =
                AppError::Internal(format!("response body error: {e}")).into_response();
            (response, String::new())
        }
    }
}

/// Cut `s` to `max` characters, marking the cut with `...`.
fn truncate_chars(s: &str, max: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max) {
        Some((idx, _)) => {
            let kept = s.get(..idx).unwrap_or(s);
            Cow::Owned(format!("{kept}{TRUNCATION_SUFFIX}"))
        }
        None => Cow::Borrowed(s),
    }
}
