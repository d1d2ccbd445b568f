//! Configuration for the bridge server
//!
//! All configuration is loaded from environment variables following the
//! pattern `OUTLOOK_MCP_<AREA>_<KEY>`. Every knob has a default suitable for
//! a local Outlook installation; a `.env` file is honored via `dotenvy` in
//! `main`. File-based configuration is an external collaborator's job.

use std::env;
use std::env::VarError;
use std::time::Duration;

use crate::errors::{invalid_field, ServerResult};

/// Connection pool sizing and lifecycle knobs
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Handles kept warm at all times
    pub min_connections: usize,
    /// Hard cap on live handles; also the blocking-call budget
    pub max_connections: usize,
    /// Idle handles above `min_connections` are retired past this age
    pub max_idle: Duration,
    /// Handles are recycled once older than this, idle or not
    pub max_age: Duration,
    /// Cadence of the probe/retire/top-up maintenance pass
    pub probe_interval: Duration,
}

/// Token-bucket rate limiter knobs
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Sustained requests per second
    pub rps: f64,
    /// Burst capacity of the bucket
    pub burst: u32,
    /// Secondary quota: requests per minute
    pub per_minute: u32,
    /// Secondary quota: requests per hour
    pub per_hour: u32,
}

/// Cache sizing and freshness knobs
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Soft byte budget shared by all three logical caches
    pub max_bytes: usize,
    /// TTL for email summaries, search results, and full bodies
    pub email_ttl: Duration,
    /// TTL for the folder listing
    pub folder_ttl: Duration,
    /// Cadence of the expiry/eviction sweep
    pub cleanup_interval: Duration,
    /// Full emails to prefetch after a listing; 0 disables prefetch
    pub prefetch_count: usize,
}

/// Folder access policy and content limits
#[derive(Debug, Clone)]
pub struct SecuritySettings {
    /// When non-empty, only these folders (by id or name) may be read
    pub allowed_folders: Vec<String>,
    /// Folders (by id or name) that must never be read
    pub blocked_folders: Vec<String>,
    /// Body bytes beyond this are truncated before caching and return
    pub max_email_size_bytes: usize,
    /// Reserved for an external HTML sanitizer; the core passes HTML raw
    pub sanitize_html: bool,
}

/// Server-wide configuration
///
/// Shared into handlers through the server context; construct with
/// [`ServerConfig::load_from_env`] or field-by-field in tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind host
    pub server_host: String,
    /// HTTP bind port
    pub server_port: u16,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Concurrent in-flight request bound
    pub max_concurrent_requests: usize,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Budget for opening a new store handle
    pub outlook_connection_timeout: Duration,
    /// Refuse to start when the first probe fails
    pub strict_startup: bool,
    /// Grace window for outstanding requests during shutdown
    pub shutdown_grace: Duration,
    pub pool: PoolSettings,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub security: SecuritySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_owned(),
            server_port: 8000,
            log_level: "info".to_owned(),
            max_concurrent_requests: 32,
            request_timeout: Duration::from_secs(30),
            outlook_connection_timeout: Duration::from_secs(10),
            strict_startup: false,
            shutdown_grace: Duration::from_secs(15),
            pool: PoolSettings {
                min_connections: 1,
                max_connections: 5,
                max_idle: Duration::from_secs(300),
                max_age: Duration::from_secs(3600),
                probe_interval: Duration::from_secs(60),
            },
            rate_limit: RateLimitSettings {
                rps: 10.0,
                burst: 20,
                per_minute: 300,
                per_hour: 1000,
            },
            cache: CacheSettings {
                max_bytes: 50 * 1024 * 1024,
                email_ttl: Duration::from_secs(300),
                folder_ttl: Duration::from_secs(600),
                cleanup_interval: Duration::from_secs(60),
                prefetch_count: 0,
            },
            security: SecuritySettings {
                allowed_folders: Vec::new(),
                blocked_folders: Vec::new(),
                max_email_size_bytes: 10 * 1024 * 1024,
                sanitize_html: false,
            },
        }
    }
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Unset variables fall back to the defaults above.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending variable when a value
    /// is set but malformed, or when the combination is inconsistent
    /// (e.g. `pool min > max`).
    pub fn load_from_env() -> ServerResult<Self> {
        let defaults = Self::default();
        let config = Self {
            server_host: parse_string_env("OUTLOOK_MCP_SERVER_HOST", &defaults.server_host),
            server_port: parse_u16_env("OUTLOOK_MCP_SERVER_PORT", defaults.server_port)?,
            log_level: parse_string_env("OUTLOOK_MCP_LOG_LEVEL", &defaults.log_level),
            max_concurrent_requests: parse_usize_env(
                "OUTLOOK_MCP_MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            request_timeout: parse_secs_env(
                "OUTLOOK_MCP_REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout,
            )?,
            outlook_connection_timeout: parse_secs_env(
                "OUTLOOK_MCP_CONNECTION_TIMEOUT_SECONDS",
                defaults.outlook_connection_timeout,
            )?,
            strict_startup: parse_bool_env("OUTLOOK_MCP_STRICT_STARTUP", defaults.strict_startup)?,
            shutdown_grace: parse_secs_env(
                "OUTLOOK_MCP_SHUTDOWN_GRACE_SECONDS",
                defaults.shutdown_grace,
            )?,
            pool: PoolSettings {
                min_connections: parse_usize_env(
                    "OUTLOOK_MCP_POOL_MIN_CONNECTIONS",
                    defaults.pool.min_connections,
                )?,
                max_connections: parse_usize_env(
                    "OUTLOOK_MCP_POOL_MAX_CONNECTIONS",
                    defaults.pool.max_connections,
                )?,
                max_idle: parse_secs_env(
                    "OUTLOOK_MCP_POOL_MAX_IDLE_SECONDS",
                    defaults.pool.max_idle,
                )?,
                max_age: parse_secs_env("OUTLOOK_MCP_POOL_MAX_AGE_SECONDS", defaults.pool.max_age)?,
                probe_interval: parse_secs_env(
                    "OUTLOOK_MCP_POOL_PROBE_INTERVAL_SECONDS",
                    defaults.pool.probe_interval,
                )?,
            },
            rate_limit: RateLimitSettings {
                rps: parse_f64_env("OUTLOOK_MCP_RATE_LIMIT_RPS", defaults.rate_limit.rps)?,
                burst: parse_u32_env("OUTLOOK_MCP_RATE_LIMIT_BURST", defaults.rate_limit.burst)?,
                per_minute: parse_u32_env(
                    "OUTLOOK_MCP_RATE_LIMIT_PER_MINUTE",
                    defaults.rate_limit.per_minute,
                )?,
                per_hour: parse_u32_env(
                    "OUTLOOK_MCP_RATE_LIMIT_PER_HOUR",
                    defaults.rate_limit.per_hour,
                )?,
            },
            cache: CacheSettings {
                max_bytes: parse_usize_env("OUTLOOK_MCP_CACHE_MAX_BYTES", defaults.cache.max_bytes)?,
                email_ttl: parse_secs_env(
                    "OUTLOOK_MCP_CACHE_EMAIL_TTL_SECONDS",
                    defaults.cache.email_ttl,
                )?,
                folder_ttl: parse_secs_env(
                    "OUTLOOK_MCP_CACHE_FOLDER_TTL_SECONDS",
                    defaults.cache.folder_ttl,
                )?,
                cleanup_interval: parse_secs_env(
                    "OUTLOOK_MCP_CACHE_CLEANUP_INTERVAL_SECONDS",
                    defaults.cache.cleanup_interval,
                )?,
                prefetch_count: parse_usize_env(
                    "OUTLOOK_MCP_CACHE_PREFETCH_COUNT",
                    defaults.cache.prefetch_count,
                )?,
            },
            security: SecuritySettings {
                allowed_folders: parse_list_env("OUTLOOK_MCP_SECURITY_ALLOWED_FOLDERS"),
                blocked_folders: parse_list_env("OUTLOOK_MCP_SECURITY_BLOCKED_FOLDERS"),
                max_email_size_bytes: parse_usize_env(
                    "OUTLOOK_MCP_SECURITY_MAX_EMAIL_SIZE_BYTES",
                    defaults.security.max_email_size_bytes,
                )?,
                sanitize_html: parse_bool_env(
                    "OUTLOOK_MCP_SECURITY_SANITIZE_HTML",
                    defaults.security.sanitize_html,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> ServerResult<()> {
        if self.pool.max_connections == 0 {
            return Err(invalid_field(
                "OUTLOOK_MCP_POOL_MAX_CONNECTIONS",
                "pool must allow at least one connection",
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(invalid_field(
                "OUTLOOK_MCP_POOL_MIN_CONNECTIONS",
                "pool min_connections must not exceed max_connections",
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(invalid_field(
                "OUTLOOK_MCP_MAX_CONCURRENT_REQUESTS",
                "at least one concurrent request must be allowed",
            ));
        }
        if self.rate_limit.rps <= 0.0 {
            return Err(invalid_field(
                "OUTLOOK_MCP_RATE_LIMIT_RPS",
                "rps must be positive",
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(invalid_field(
                "OUTLOOK_MCP_RATE_LIMIT_BURST",
                "burst must be at least 1",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid_field(
                "OUTLOOK_MCP_REQUEST_TIMEOUT_SECONDS",
                "request timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Read a string environment variable with default fallback
fn parse_string_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_owned(),
    }
}

/// Parse a comma-separated list environment variable; unset means empty
fn parse_list_env(key: &str) -> Vec<String> {
    match env::var(key) {
        Ok(v) => v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy), case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> ServerResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v)
            .ok_or_else(|| invalid_field(key, format!("invalid boolean value '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(invalid_field(key, "contains non-unicode data")),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a seconds-valued environment variable into a `Duration`
fn parse_secs_env(key: &str, default: Duration) -> ServerResult<Duration> {
    Ok(Duration::from_secs(parse_u64_env(
        key,
        default.as_secs(),
    )?))
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> ServerResult<u64> {
    parse_number_env(key, default)
}

/// Parse a `u32` environment variable with default fallback
fn parse_u32_env(key: &str, default: u32) -> ServerResult<u32> {
    parse_number_env(key, default)
}

/// Parse a `u16` environment variable with default fallback
fn parse_u16_env(key: &str, default: u16) -> ServerResult<u16> {
    parse_number_env(key, default)
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> ServerResult<usize> {
    parse_number_env(key, default)
}

/// Parse an `f64` environment variable with default fallback
fn parse_f64_env(key: &str, default: f64) -> ServerResult<f64> {
    parse_number_env(key, default)
}

/// Shared numeric parsing over `FromStr`
///
/// Returns `default` if unset; a set-but-malformed value is an error rather
/// than a silent fallback.
fn parse_number_env<T>(key: &str, default: T) -> ServerResult<T>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| invalid_field(key, format!("invalid numeric value '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(invalid_field(key, "contains non-unicode data")),
    }
}

/// Environment variables recognized by the server, with their defaults
///
/// Used by the `--help` output in `main`.
pub fn documented_env_keys() -> Vec<(&'static str, String)> {
    let d = ServerConfig::default();
    vec![
        ("OUTLOOK_MCP_SERVER_HOST", d.server_host.clone()),
        ("OUTLOOK_MCP_SERVER_PORT", d.server_port.to_string()),
        ("OUTLOOK_MCP_LOG_LEVEL", d.log_level.clone()),
        (
            "OUTLOOK_MCP_MAX_CONCURRENT_REQUESTS",
            d.max_concurrent_requests.to_string(),
        ),
        (
            "OUTLOOK_MCP_REQUEST_TIMEOUT_SECONDS",
            d.request_timeout.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_CONNECTION_TIMEOUT_SECONDS",
            d.outlook_connection_timeout.as_secs().to_string(),
        ),
        ("OUTLOOK_MCP_STRICT_STARTUP", d.strict_startup.to_string()),
        (
            "OUTLOOK_MCP_SHUTDOWN_GRACE_SECONDS",
            d.shutdown_grace.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_POOL_MIN_CONNECTIONS",
            d.pool.min_connections.to_string(),
        ),
        (
            "OUTLOOK_MCP_POOL_MAX_CONNECTIONS",
            d.pool.max_connections.to_string(),
        ),
        (
            "OUTLOOK_MCP_POOL_MAX_IDLE_SECONDS",
            d.pool.max_idle.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_POOL_MAX_AGE_SECONDS",
            d.pool.max_age.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_POOL_PROBE_INTERVAL_SECONDS",
            d.pool.probe_interval.as_secs().to_string(),
        ),
        ("OUTLOOK_MCP_RATE_LIMIT_RPS", d.rate_limit.rps.to_string()),
        (
            "OUTLOOK_MCP_RATE_LIMIT_BURST",
            d.rate_limit.burst.to_string(),
        ),
        (
            "OUTLOOK_MCP_RATE_LIMIT_PER_MINUTE",
            d.rate_limit.per_minute.to_string(),
        ),
        (
            "OUTLOOK_MCP_RATE_LIMIT_PER_HOUR",
            d.rate_limit.per_hour.to_string(),
        ),
        ("OUTLOOK_MCP_CACHE_MAX_BYTES", d.cache.max_bytes.to_string()),
        (
            "OUTLOOK_MCP_CACHE_EMAIL_TTL_SECONDS",
            d.cache.email_ttl.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_CACHE_FOLDER_TTL_SECONDS",
            d.cache.folder_ttl.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_CACHE_CLEANUP_INTERVAL_SECONDS",
            d.cache.cleanup_interval.as_secs().to_string(),
        ),
        (
            "OUTLOOK_MCP_CACHE_PREFETCH_COUNT",
            d.cache.prefetch_count.to_string(),
        ),
        ("OUTLOOK_MCP_SECURITY_ALLOWED_FOLDERS", String::new()),
        ("OUTLOOK_MCP_SECURITY_BLOCKED_FOLDERS", String::new()),
        (
            "OUTLOOK_MCP_SECURITY_MAX_EMAIL_SIZE_BYTES",
            d.security.max_email_size_bytes.to_string(),
        ),
        (
            "OUTLOOK_MCP_SECURITY_SANITIZE_HTML",
            d.security.sanitize_html.to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::{parse_bool_value, ServerConfig};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }
        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn default_config_passes_validation() {
        ServerConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn inconsistent_pool_bounds_fail_validation() {
        let mut config = ServerConfig::default();
        config.pool.min_connections = 10;
        config.pool.max_connections = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rps_fails_validation() {
        let mut config = ServerConfig::default();
        config.rate_limit.rps = 0.0;
        assert!(config.validate().is_err());
    }
}
