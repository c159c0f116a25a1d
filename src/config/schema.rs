//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the rotator.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the rotation service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RotatorConfig {
    /// Operator API listener.
    pub server: ServerConfig,

    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,

    /// Backoff and auto-pause schedule.
    pub backoff: BackoffConfig,

    /// Handling of 429 responses.
    pub rate_limit: RateLimitConfig,

    /// Deadlines for provider calls, attempts and store operations.
    pub timeouts: TimeoutConfig,

    /// Periodic rotation loop.
    pub scheduler: SchedulerConfig,

    pub alerts: AlertConfig,

    pub chaos: ChaosConfig,

    /// POS providers the service can rotate against.
    pub providers: Vec<ProviderConfig>,

    pub settings_cache: SettingsCacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl RotatorConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Operator API listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Per-request timeout for the operator API in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,

    /// Seconds an open breaker waits before allowing a probe.
    pub cool_down_secs: u64,

    /// Also keep a breaker per (provider, location).
    pub per_location: bool,

    /// Per-provider overrides keyed by provider name.
    pub overrides: HashMap<String, BreakerOverride>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            cool_down_secs: 60,
            per_location: false,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BreakerOverride {
    pub threshold: Option<u32>,
    pub cool_down_secs: Option<u64>,
}

/// Backoff configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,

    /// Consecutive failures before the key is paused.
    pub pause_after_failures: u32,

    pub pause_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            cap_secs: 1800,
            jitter_min: 0.9,
            jitter_max: 1.1,
            pause_after_failures: 5,
            pause_secs: 2 * 60 * 60,
        }
    }
}

/// What to do when a 429 arrives without a Retry-After header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryAfterFallback {
    /// Use the normal exponential backoff.
    #[default]
    Backoff,
    /// Wait a random number of seconds in `[min_secs, max_secs]`.
    RandomRange { min_secs: u64, max_secs: u64 },
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RateLimitConfig {
    pub fallback: RetryAfterFallback,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout for provider calls in seconds.
    pub connect_secs: u64,

    /// Single provider request timeout in seconds.
    pub provider_request_secs: u64,

    /// Whole attempt deadline (token exchange plus verification) in seconds.
    pub attempt_secs: u64,

    /// Deadline for every store operation in seconds.
    pub store_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            provider_request_secs: 10,
            attempt_secs: 30,
            store_secs: 5,
        }
    }
}

/// Periodic rotation loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// Seconds between scans for due credentials.
    pub interval_secs: u64,

    /// Rotate tokens expiring within this many seconds.
    pub refresh_before_expiry_secs: u64,

    /// Re-verify a credential at least this often, whatever its expiry.
    /// Must stay below `alerts.heartbeat_max_silence_secs`.
    pub max_verified_age_secs: u64,

    /// Upper bound on attempts running at once.
    pub max_concurrent_attempts: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            refresh_before_expiry_secs: 15 * 60,
            max_verified_age_secs: 4 * 60 * 60,
            max_concurrent_attempts: 16,
        }
    }
}

/// Alert delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Chat/incident webhook. Alerts are only logged when unset.
    pub webhook_url: Option<String>,

    pub webhook_timeout_secs: u64,

    /// Same-condition suppression window in seconds.
    pub dedup_window_secs: u64,

    /// Consecutive attempt failures that raise a warning.
    pub failure_alert_threshold: u32,

    pub heartbeat_enabled: bool,

    pub heartbeat_interval_secs: u64,

    /// A key without a successful run for this long is reported as silent.
    pub heartbeat_max_silence_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: 5,
            dedup_window_secs: 15 * 60,
            failure_alert_threshold: 3,
            heartbeat_enabled: true,
            heartbeat_interval_secs: 5 * 60,
            heartbeat_max_silence_secs: 6 * 60 * 60,
        }
    }
}

/// Chaos harness configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Allow chaos runs to be started through the operator API.
    pub enabled: bool,

    /// Hard cap on how long a caller waits for a run to finish.
    pub max_wait_secs: u64,

    pub poll_interval_ms: u64,

    /// Upper bound on a single scenario's runtime.
    pub scenario_duration_secs: u64,

    pub default_attempts: u32,

    pub default_concurrency: u32,

    /// Finished runs kept for status queries. Oldest verdicts go first.
    pub max_retained_runs: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_wait_secs: 30 * 60,
            poll_interval_ms: 500,
            scenario_duration_secs: 120,
            default_attempts: 12,
            default_concurrency: 100,
            max_retained_runs: 200,
        }
    }
}

/// One POS provider endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Provider identifier (e.g. "square", "toast").
    pub name: String,

    pub base_url: String,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_identity_path")]
    pub identity_path: String,
}

fn default_token_path() -> String {
    "/oauth/token".to_string()
}

fn default_identity_path() -> String {
    "/v1/me".to_string()
}

/// Location settings cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingsCacheConfig {
    pub ttl_secs: u64,

    /// Coalescing window for change events before the cache is dropped.
    pub debounce_ms: u64,
}

impl Default for SettingsCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5 * 60,
            debounce_ms: 250,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
