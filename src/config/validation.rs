//! Configuration validation utilities.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `2h30m`, `1d`, `100ms`, etc.
/// A bare number is interpreted as seconds.
///
/// # Examples
///
/// ```
/// use query_exporter::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// assert_eq!(parse_duration("90").unwrap().as_secs(), 90);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds_to_duration(secs);
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn seconds_to_duration(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {secs}: {e}"))
}

/// Raw duration as written in YAML: either a number of seconds or a humantime string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(f64),
    Text(String),
}

/// Deserialize an optional duration given as seconds or as a humantime string.
pub(crate) fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    raw.map(|raw| match raw {
        RawDuration::Seconds(secs) => seconds_to_duration(secs),
        RawDuration::Text(text) => parse_duration(&text),
    })
    .transpose()
    .map_err(serde::de::Error::custom)
}

/// Check that a metric or label name is a valid Prometheus identifier.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    static IDENT_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = IDENT_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("failed to compile identifier regex")
    });

    if regex.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!("invalid name: '{name}'")))
    }
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("-5").is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("query_latency").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("with-dash").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("postgres://u:${NONEXISTENT_DB_PASS_12345:-secret}@h/db");
        assert_eq!(result, "postgres://u:secret@h/db");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: This test runs in isolation and only modifies a test-specific variable.
        unsafe {
            std::env::set_var("QE_TEST_VAR_EXPAND", "secret_value");
        }
        let result = expand_env_vars("password=${QE_TEST_VAR_EXPAND}");
        assert_eq!(result, "password=secret_value");
        // SAFETY: Cleanup test variable.
        unsafe {
            std::env::remove_var("QE_TEST_VAR_EXPAND");
        }
    }
}
