//! Client configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::batch::BackoffConfig;
use crate::error::{ClientError, ClientResult};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_BATCH_LINGER: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_REQUESTS_PER_BATCH: usize = 1000;
pub const DEFAULT_MAX_WRITE_BATCH_BYTES: usize = 128 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Namespace whose shard assignments the client follows.
    pub namespace: String,
    /// How long the first call of a batch waits for more calls. Zero flushes
    /// whatever is queued without waiting.
    pub batch_linger: Duration,
    pub max_requests_per_batch: usize,
    /// Cap on key + value bytes per write batch.
    pub max_write_batch_bytes: usize,
    /// Overall bound on one batch's execution, retries included.
    pub request_timeout: Duration,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            batch_linger: DEFAULT_BATCH_LINGER,
            max_requests_per_batch: DEFAULT_MAX_REQUESTS_PER_BATCH,
            max_write_batch_bytes: DEFAULT_MAX_WRITE_BATCH_BYTES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_backoff_initial: DEFAULT_RETRY_BACKOFF_INITIAL,
            retry_backoff_max: DEFAULT_RETRY_BACKOFF_MAX,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> ClientResult<()> {
        if self.namespace.is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        if self.max_requests_per_batch == 0 {
            return Err(invalid("max_requests_per_batch must be greater than zero"));
        }
        if self.max_write_batch_bytes == 0 {
            return Err(invalid("max_write_batch_bytes must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout must be greater than zero"));
        }
        if self.retry_backoff_initial.is_zero() {
            return Err(invalid("retry_backoff_initial must be greater than zero"));
        }
        if self.retry_backoff_initial > self.retry_backoff_max {
            return Err(invalid(
                "retry_backoff_initial must not exceed retry_backoff_max",
            ));
        }
        Ok(())
    }

    /// Load from `SHARDLINE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            namespace: lookup("SHARDLINE_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            batch_linger: parse_duration(lookup("SHARDLINE_BATCH_LINGER"), DEFAULT_BATCH_LINGER)?,
            max_requests_per_batch: parse_usize(
                lookup("SHARDLINE_MAX_REQUESTS_PER_BATCH"),
                DEFAULT_MAX_REQUESTS_PER_BATCH,
            )?,
            max_write_batch_bytes: parse_usize(
                lookup("SHARDLINE_MAX_WRITE_BATCH_BYTES"),
                DEFAULT_MAX_WRITE_BATCH_BYTES,
            )?,
            request_timeout: parse_duration(
                lookup("SHARDLINE_REQUEST_TIMEOUT"),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            retry_backoff_initial: parse_duration(
                lookup("SHARDLINE_RETRY_BACKOFF_INITIAL"),
                DEFAULT_RETRY_BACKOFF_INITIAL,
            )?,
            retry_backoff_max: parse_duration(
                lookup("SHARDLINE_RETRY_BACKOFF_MAX"),
                DEFAULT_RETRY_BACKOFF_MAX,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: self.retry_backoff_initial,
            max: self.retry_backoff_max,
        }
    }
}

fn invalid(message: &str) -> ClientError {
    ClientError::InvalidConfig(message.to_string())
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_duration(value: Option<String>, default_value: Duration) -> Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("invalid duration value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_linger, Duration::from_millis(5));
        assert_eq!(config.max_requests_per_batch, 1000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_linger_is_allowed() {
        let config = ClientConfig {
            batch_linger: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let cases = [
            ClientConfig {
                max_requests_per_batch: 0,
                ..Default::default()
            },
            ClientConfig {
                request_timeout: Duration::ZERO,
                ..Default::default()
            },
            ClientConfig {
                max_write_batch_bytes: 0,
                ..Default::default()
            },
            ClientConfig {
                retry_backoff_initial: Duration::from_secs(20),
                ..Default::default()
            },
            ClientConfig {
                namespace: String::new(),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ClientError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SHARDLINE_NAMESPACE", "orders"),
            ("SHARDLINE_BATCH_LINGER", "0ms"),
            ("SHARDLINE_MAX_REQUESTS_PER_BATCH", "64"),
            ("SHARDLINE_REQUEST_TIMEOUT", "2s"),
        ]))
        .unwrap();
        assert_eq!(config.namespace, "orders");
        assert_eq!(config.batch_linger, Duration::ZERO);
        assert_eq!(config.max_requests_per_batch, 64);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.max_write_batch_bytes, DEFAULT_MAX_WRITE_BATCH_BYTES);
    }

    #[test]
    fn malformed_env_values_are_errors() {
        assert!(ClientConfig::from_lookup(lookup(&[("SHARDLINE_BATCH_LINGER", "soon")])).is_err());
        assert!(
            ClientConfig::from_lookup(lookup(&[("SHARDLINE_MAX_REQUESTS_PER_BATCH", "-1")]))
                .is_err()
        );
        assert!(
            ClientConfig::from_lookup(lookup(&[("SHARDLINE_MAX_REQUESTS_PER_BATCH", "0")]))
                .is_err()
        );
    }
}
