//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, jitter band ordered, URLs parse)
//! - Detect duplicate provider names and dangling breaker overrides
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RotatorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::{RetryAfterFallback, RotatorConfig};

/// One semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &RotatorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("server.bind_address", "not a socket address"));
    }
    if config.server.api_key.trim().is_empty() {
        errors.push(ValidationError::new("server.api_key", "must not be empty"));
    }

    if config.breaker.threshold == 0 {
        errors.push(ValidationError::new("breaker.threshold", "must be at least 1"));
    }
    if config.breaker.cool_down_secs == 0 {
        errors.push(ValidationError::new("breaker.cool_down_secs", "must be positive"));
    }
    for (name, o) in &config.breaker.overrides {
        if config.provider(name).is_none() {
            errors.push(ValidationError::new(
                format!("breaker.overrides.{name}"),
                "no provider with this name",
            ));
        }
        if o.threshold == Some(0) {
            errors.push(ValidationError::new(
                format!("breaker.overrides.{name}.threshold"),
                "must be at least 1",
            ));
        }
    }

    let b = &config.backoff;
    if b.base_secs == 0 {
        errors.push(ValidationError::new("backoff.base_secs", "must be positive"));
    }
    if b.cap_secs < b.base_secs {
        errors.push(ValidationError::new("backoff.cap_secs", "must be >= base_secs"));
    }
    if !(b.jitter_min > 0.0 && b.jitter_min <= b.jitter_max && b.jitter_max.is_finite()) {
        errors.push(ValidationError::new(
            "backoff.jitter",
            "expected 0 < jitter_min <= jitter_max",
        ));
    }
    if b.pause_after_failures == 0 {
        errors.push(ValidationError::new("backoff.pause_after_failures", "must be at least 1"));
    }

    if let RetryAfterFallback::RandomRange { min_secs, max_secs } = config.rate_limit.fallback {
        if min_secs > max_secs {
            errors.push(ValidationError::new(
                "rate_limit.fallback",
                "min_secs must be <= max_secs",
            ));
        }
    }

    let t = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_secs", t.connect_secs),
        ("timeouts.provider_request_secs", t.provider_request_secs),
        ("timeouts.attempt_secs", t.attempt_secs),
        ("timeouts.store_secs", t.store_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be positive"));
        }
    }

    if config.scheduler.interval_secs == 0 {
        errors.push(ValidationError::new("scheduler.interval_secs", "must be positive"));
    }
    if config.scheduler.max_concurrent_attempts == 0 {
        errors.push(ValidationError::new(
            "scheduler.max_concurrent_attempts",
            "must be at least 1",
        ));
    }

    if config.scheduler.max_verified_age_secs == 0 {
        errors.push(ValidationError::new("scheduler.max_verified_age_secs", "must be positive"));
    }

    let a = &config.alerts;
    if a.heartbeat_enabled {
        if a.heartbeat_interval_secs == 0 {
            errors.push(ValidationError::new("alerts.heartbeat_interval_secs", "must be positive"));
        }
        if a.heartbeat_max_silence_secs == 0 {
            errors.push(ValidationError::new("alerts.heartbeat_max_silence_secs", "must be positive"));
        } else if config.scheduler.enabled
            && config.scheduler.max_verified_age_secs >= a.heartbeat_max_silence_secs
        {
            errors.push(ValidationError::new(
                "scheduler.max_verified_age_secs",
                "must be below alerts.heartbeat_max_silence_secs",
            ));
        }
    }

    if let Some(url) = &config.alerts.webhook_url {
        if Url::parse(url).is_err() {
            errors.push(ValidationError::new("alerts.webhook_url", "not a valid URL"));
        }
    }

    if config.chaos.max_wait_secs == 0 || config.chaos.poll_interval_ms == 0 {
        errors.push(ValidationError::new("chaos", "max_wait_secs and poll_interval_ms must be positive"));
    }
    if config.chaos.max_retained_runs == 0 {
        errors.push(ValidationError::new("chaos.max_retained_runs", "must be at least 1"));
    }

    let mut seen = HashSet::new();
    for (i, p) in config.providers.iter().enumerate() {
        if p.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("providers[{i}].name"), "must not be empty"));
        } else if !seen.insert(p.name.as_str()) {
            errors.push(ValidationError::new(
                format!("providers[{i}].name"),
                format!("duplicate provider '{}'", p.name),
            ));
        }
        if Url::parse(&p.base_url).is_err() {
            errors.push(ValidationError::new(
                format!("providers[{i}].base_url"),
                "not a valid URL",
            ));
        }
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "expected \"pretty\" or \"json\"",
        ));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BreakerOverride, ProviderConfig};

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: "https://pos.example.com".to_string(),
            token_path: "/oauth/token".to_string(),
            identity_path: "/v1/me".to_string(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&RotatorConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = RotatorConfig::default();
        config.breaker.threshold = 0;
        config.backoff.jitter_min = 1.2;
        config.timeouts.attempt_secs = 0;
        config.providers = vec![provider("square"), provider("square")];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"breaker.threshold"));
        assert!(fields.contains(&"backoff.jitter"));
        assert!(fields.contains(&"timeouts.attempt_secs"));
        assert!(fields.contains(&"providers[1].name"));
    }

    #[test]
    fn test_override_must_name_a_provider() {
        let mut config = RotatorConfig::default();
        config.providers = vec![provider("square")];
        config
            .breaker
            .overrides
            .insert("toast".to_string(), BreakerOverride::default());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "breaker.overrides.toast");
    }

    #[test]
    fn test_inverted_random_range() {
        let mut config = RotatorConfig::default();
        config.rate_limit.fallback = RetryAfterFallback::RandomRange {
            min_secs: 30,
            max_secs: 1,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_heartbeat_needs_positive_periods() {
        let mut config = RotatorConfig::default();
        config.alerts.heartbeat_interval_secs = 0;
        config.alerts.heartbeat_max_silence_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"alerts.heartbeat_interval_secs"));
        assert!(fields.contains(&"alerts.heartbeat_max_silence_secs"));

        config.alerts.heartbeat_enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_verified_age_below_heartbeat_silence() {
        let mut config = RotatorConfig::default();
        config.scheduler.max_verified_age_secs = config.alerts.heartbeat_max_silence_secs;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "scheduler.max_verified_age_secs");
    }
}
