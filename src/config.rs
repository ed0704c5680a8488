//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Request Guards
//!
//! - `REQUEST_TIMEOUT_MS`: Per-request deadline (default: 30000, 0 = disabled)
//! - `TIMEOUT_EXEMPT_PATHS`: Comma-separated path prefixes without a deadline
//! - `RATE_LIMIT_RPS`: Requests per second per client, fractional allowed (default: 100)
//! - `RATE_LIMIT_BURST`: Burst capacity for rate limiter (default: 50)
//! - `MAX_REQUEST_BODY_MB`: Request body limit in MiB (default: 10, 0 = disabled)
//!
//! # Cross-Origin
//!
//! - `CORS_ALLOWED_ORIGINS`, `CORS_ALLOWED_METHODS`, `CORS_ALLOWED_HEADERS`,
//!   `CORS_EXPOSE_HEADERS`: Comma-separated lists (default: `*`)
//! - `CORS_ALLOW_CREDENTIALS`: `true` / `false` (default: false)
//! - `CORS_MAX_AGE_SECS`: Preflight cache lifetime (default: unset)
//!
//! # Observability
//!
//! - `ACCESS_LOG_TAG`, `ACCESS_LOG_MAX_PARAM`, `ACCESS_LOG_MAX_RESPONSE`,
//!   `ACCESS_LOG_SKIP_PATHS`: Access log settings
//! - `RUST_LOG`: Log filter (default: info)
//! - `LOG_FORMAT`: `pretty` or `json` (default: pretty)
//! - `METRICS_PORT`: Prometheus endpoint port (default: 9090, 0 = disabled)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::{AccessLogConfig, CorsConfig, DeadlineConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Deadline Configuration
    // =========================================================================
    /// Maximum time a request may take (default: 30s, zero = disabled)
    pub request_timeout: Duration,

    /// Path prefixes that run without a deadline (streaming, uploads...)
    pub timeout_exempt_paths: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests per second limit per client (default: 100)
    /// Set to 0 to disable rate limiting
    pub rate_limit_rps: f64,

    /// Burst capacity - allows temporary spikes above rps limit (default: 50)
    pub rate_limit_burst: u32,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// X-Forwarded-For headers will only be trusted if the connection
    /// originates from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources - NOT recommended for production)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Request Body Configuration
    // =========================================================================
    /// Maximum request body size in MiB (default: 10, 0 = disabled)
    pub max_request_body_mb: usize,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    pub cors_allowed_origins: Vec<String>,
    pub cors_allowed_methods: Vec<String>,
    pub cors_allowed_headers: Vec<String>,
    pub cors_expose_headers: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_max_age: Option<Duration>,

    // =========================================================================
    // Access Log Configuration
    // =========================================================================
    /// Tag attached to every access log record
    pub access_log_tag: String,

    /// Maximum characters of request parameters logged (default: 1000)
    pub access_log_max_param: usize,

    /// Maximum characters of response body logged (default: 1000)
    pub access_log_max_response: usize,

    /// Path prefixes that are not access logged
    pub access_log_skip_paths: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, negative rate).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,

            // Deadline
            request_timeout: Duration::from_millis(Self::parse_env(
                "REQUEST_TIMEOUT_MS",
                30_000,
            )?),
            timeout_exempt_paths: Self::parse_list("TIMEOUT_EXEMPT_PATHS", ""),

            // Rate limiting
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", defaults.rate_limit_rps)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Request body
            max_request_body_mb: Self::parse_env(
                "MAX_REQUEST_BODY_MB",
                defaults.max_request_body_mb,
            )?,

            // CORS
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            cors_allowed_methods: Self::parse_list("CORS_ALLOWED_METHODS", "*"),
            cors_allowed_headers: Self::parse_list("CORS_ALLOWED_HEADERS", "*"),
            cors_expose_headers: Self::parse_list("CORS_EXPOSE_HEADERS", "*"),
            cors_allow_credentials: Self::parse_env("CORS_ALLOW_CREDENTIALS", false)?,
            cors_max_age: Self::parse_optional_env::<u64>("CORS_MAX_AGE_SECS")?
                .map(Duration::from_secs),

            // Access log
            access_log_tag: env::var("ACCESS_LOG_TAG").unwrap_or(defaults.access_log_tag),
            access_log_max_param: Self::parse_env(
                "ACCESS_LOG_MAX_PARAM",
                defaults.access_log_max_param,
            )?,
            access_log_max_response: Self::parse_env(
                "ACCESS_LOG_MAX_RESPONSE",
                defaults.access_log_max_response,
            )?,
            access_log_skip_paths: Self::parse_list("ACCESS_LOG_SKIP_PATHS", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps < 0.0 {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_RPS must be a finite value >= 0 (got {})",
                self.rate_limit_rps
            )));
        }

        if self
            .timeout_exempt_paths
            .iter()
            .chain(&self.access_log_skip_paths)
            .any(|p| !p.starts_with('/'))
        {
            return Err(AppError::ConfigError(
                "TIMEOUT_EXEMPT_PATHS and ACCESS_LOG_SKIP_PATHS entries must start with '/'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0.0
    }

    /// Check if the request deadline is enabled.
    pub fn deadline_enabled(&self) -> bool {
        !self.request_timeout.is_zero()
    }

    /// Check if trusted proxy validation is enabled.
    ///
    /// When enabled, X-Forwarded-For headers are only trusted if the request
    /// originates from a configured trusted proxy network. The rate limiter
    /// keys on the peer address whenever this is off.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    pub fn deadline_config(&self) -> DeadlineConfig {
        DeadlineConfig::new(self.request_timeout, self.timeout_exempt_paths.clone())
    }

    pub fn cors_config(&self) -> CorsConfig {
        CorsConfig {
            allowed_origins: self.cors_allowed_origins.clone(),
            allowed_methods: self.cors_allowed_methods.clone(),
            allowed_headers: self.cors_allowed_headers.clone(),
            expose_headers: self.cors_expose_headers.clone(),
            allow_credentials: self.cors_allow_credentials,
            max_age: self.cors_max_age,
        }
    }

    pub fn access_log_config(&self) -> AccessLogConfig {
        AccessLogConfig {
            tag: self.access_log_tag.clone(),
            max_param_chars: self.access_log_max_param,
            max_response_chars: self.access_log_max_response,
            skip_prefixes: self.access_log_skip_paths.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(Self::parse_optional_env(name)?.unwrap_or(default))
    }

    /// Parse an environment variable that has no default. Empty counts as unset.
    fn parse_optional_env<T>(name: &str) -> AppResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) if !val.trim().is_empty() => val
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(None),
        }
    }

    /// Parse a comma-separated list, dropping empty entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        let access_log = AccessLogConfig::default();
        let cors = CorsConfig::default();

        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Deadline
            request_timeout: Duration::from_secs(30),
            timeout_exempt_paths: vec![],
            // Rate limiting
            rate_limit_rps: 100.0,
            rate_limit_burst: 50,
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Request body
            max_request_body_mb: 10,
            // CORS
            cors_allowed_origins: cors.allowed_origins,
            cors_allowed_methods: cors.allowed_methods,
            cors_allowed_headers: cors.allowed_headers,
            cors_expose_headers: cors.expose_headers,
            cors_allow_credentials: cors.allow_credentials,
            cors_max_age: cors.max_age,
            // Access log
            access_log_tag: access_log.tag,
            access_log_max_param: access_log.max_param_chars,
            access_log_max_response: access_log.max_response_chars,
            access_log_skip_paths: access_log.skip_prefixes,
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
