//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::RotatorConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> ConfigResult<RotatorConfig> {
    let config: RotatorConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> ConfigResult<RotatorConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[breaker]
threshold = 4

[rate_limit.fallback]
policy = "random_range"
min_secs = 1
max_secs = 30

[[providers]]
name = "square"
base_url = "https://connect.squareup.com"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.breaker.threshold, 4);
        assert_eq!(config.breaker.cool_down_secs, 60);
        assert_eq!(config.backoff.cap_secs, 1800);
        assert_eq!(config.providers[0].token_path, "/oauth/token");
        assert_eq!(
            config.rate_limit.fallback,
            crate::config::RetryAfterFallback::RandomRange { min_secs: 1, max_secs: 30 }
        );
    }

    #[test]
    fn test_validation_errors_surface() {
        let err = parse_config("[backoff]\nbase_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("backoff.base_secs"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
