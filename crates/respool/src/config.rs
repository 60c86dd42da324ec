//! Pool configuration.
//!
//! Loadable from JSON and overridable from the environment:
//! - `RESPOOL_MIN_COUNT`
//! - `RESPOOL_MAX_COUNT` (empty for unbounded)
//! - `RESPOOL_RETRY_COUNT`
//! - `RESPOOL_RETRY_WAIT_MS`

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const ENV_MIN_COUNT: &str = "RESPOOL_MIN_COUNT";
pub const ENV_MAX_COUNT: &str = "RESPOOL_MAX_COUNT";
pub const ENV_RETRY_COUNT: &str = "RESPOOL_RETRY_COUNT";
pub const ENV_RETRY_WAIT_MS: &str = "RESPOOL_RETRY_WAIT_MS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots below this index are never evicted.
    pub min_count: usize,
    /// Upper bound on live resources; `None` is unbounded.
    pub max_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

/// Static retry policy in config form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retry_count: u32,
    pub wait_before_retry_ms: u64,
    /// Treat `wait_before_retry_ms` as the base of an exponential backoff.
    pub exponential: bool,
}

impl RetryConfig {
    pub fn to_policy<E: 'static>(&self) -> RetryPolicy<E> {
        let wait = Duration::from_millis(self.wait_before_retry_ms);
        if self.exponential {
            RetryPolicy::exponential(self.retry_count, wait)
        } else {
            RetryPolicy::fixed(self.retry_count, wait)
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.max_count {
            Some(max_count) if max_count < self.min_count => Err(ConfigError::MaxBelowMin {
                min_count: self.min_count,
                max_count,
            }),
            _ => Ok(()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `RESPOOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(min_count) = parse_var(&lookup, ENV_MIN_COUNT)? {
            self.min_count = min_count;
        }

        if let Some(value) = lookup(ENV_MAX_COUNT) {
            self.max_count = if value.trim().is_empty() {
                None
            } else {
                Some(parse_value(ENV_MAX_COUNT, &value)?)
            };
        }

        let retry_count = parse_var(&lookup, ENV_RETRY_COUNT)?;
        let wait_ms = parse_var(&lookup, ENV_RETRY_WAIT_MS)?;
        if retry_count.is_some() || wait_ms.is_some() {
            let retry = self.retry.get_or_insert_with(RetryConfig::default);
            if let Some(retry_count) = retry_count {
                retry.retry_count = retry_count;
            }
            if let Some(wait_ms) = wait_ms {
                retry.wait_before_retry_ms = wait_ms;
            }
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var).map(|value| parse_value(var, &value)).transpose()
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
