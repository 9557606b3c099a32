//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{RetryPolicy, SagaConfig};

use crate::error::ConfigError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: enables the PostgreSQL ledger when set
/// - `PROVIDER_RETRY_ATTEMPTS`: attempts per provider call (default 3)
/// - `PROVIDER_RETRY_BASE_DELAY_MS`: first backoff delay (default 1000)
/// - `PROVIDER_TIMEOUT_MS`: per-attempt timeout (default none)
/// - `REDELIVERY_LIMIT`: deliveries per event before dead-lettering (default 5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub provider_retry_attempts: u32,
    pub provider_retry_base_delay: Duration,
    pub provider_timeout: Option<Duration>,
    pub redelivery_limit: u32,
}

impl WorkerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// absent keys. Present but malformed values are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            host: value("HOST").unwrap_or(defaults.host),
            port: parse(&value, "PORT")?.unwrap_or(defaults.port),
            log_level: value("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse(&value, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
            database_url: value("DATABASE_URL"),
            provider_retry_attempts: parse(&value, "PROVIDER_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.provider_retry_attempts),
            provider_retry_base_delay: parse(&value, "PROVIDER_RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.provider_retry_base_delay),
            provider_timeout: parse(&value, "PROVIDER_TIMEOUT_MS")?.map(Duration::from_millis),
            redelivery_limit: parse(&value, "REDELIVERY_LIMIT")?
                .unwrap_or(defaults.redelivery_limit),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Saga settings derived from the provider knobs.
    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig::new(
            RetryPolicy::new(self.provider_retry_attempts, self.provider_retry_base_delay),
            self.provider_timeout,
        )
    }
}

fn parse<T>(value: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            provider_retry_attempts: RetryPolicy::PROVIDER_MAX_ATTEMPTS,
            provider_retry_base_delay: RetryPolicy::PROVIDER_INITIAL_DELAY,
            provider_timeout: None,
            redelivery_limit: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.redelivery_limit, 5);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sessions"),
            ("PROVIDER_RETRY_ATTEMPTS", "5"),
            ("PROVIDER_RETRY_BASE_DELAY_MS", "250"),
            ("PROVIDER_TIMEOUT_MS", "3000"),
            ("REDELIVERY_LIMIT", "2"),
        ])
        .unwrap();

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sessions")
        );
        assert_eq!(config.redelivery_limit, 2);

        let saga = config.saga_config();
        assert_eq!(saga.provider_retry.max_attempts(), 5);
        assert_eq!(saga.provider_retry.initial_delay(), Duration::from_millis(250));
        assert_eq!(saga.provider_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = load(&[("PORT", "  "), ("DATABASE_URL", "")]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let err = load(&[("PROVIDER_RETRY_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "PROVIDER_RETRY_ATTEMPTS", .. }
        ));
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
    }
}
