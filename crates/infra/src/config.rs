//! Runtime configuration.
//!
//! Loaded from `DATASPACE_*` environment variables or a JSON document; every
//! field has a default so partial configuration is valid.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dataspace_core::{Clock, ExponentialWaitStrategy, OwnerId, RetryManager};
use dataspace_observability::LogFormat;

pub const ENV_PREFIX: &str = "DATASPACE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("malformed configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid_value(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Settings of one connector runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Lease owner identity of this instance.
    pub runtime_id: String,
    pub lease_duration_ms: u64,
    /// Max entities claimed per processor iteration.
    pub batch_size: usize,
    pub retry_limit: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub idle_wait_ms: u64,
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_id: OwnerId::generate().to_string(),
            lease_duration_ms: 60_000,
            batch_size: 5,
            retry_limit: 7,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            idle_wait_ms: 1_000,
            database_url: None,
            log_format: LogFormat::Json,
        }
    }
}

impl RuntimeConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary variable lookup (full names, prefix included).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(id) = get("RUNTIME_ID") {
            config.runtime_id = id;
        }
        if let Some(v) = get("LEASE_DURATION_MS") {
            config.lease_duration_ms = parse("LEASE_DURATION_MS", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            config.batch_size = parse("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("RETRY_LIMIT") {
            config.retry_limit = parse("RETRY_LIMIT", &v)?;
        }
        if let Some(v) = get("RETRY_BASE_DELAY_MS") {
            config.retry_base_delay_ms = parse("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("RETRY_MAX_DELAY_MS") {
            config.retry_max_delay_ms = parse("RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = get("IDLE_WAIT_MS") {
            config.idle_wait_ms = parse("IDLE_WAIT_MS", &v)?;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(v) = get("LOG_FORMAT") {
            config.log_format = parse("LOG_FORMAT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime_id.trim().is_empty() {
            return Err(ConfigError::Invalid("runtime_id must not be empty".into()));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid("lease_duration_ms must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn with_runtime_id(mut self, runtime_id: impl Into<String>) -> Self {
        self.runtime_id = runtime_id.into();
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn owner_id(&self) -> OwnerId {
        OwnerId::new(self.runtime_id.clone())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn wait_strategy(&self) -> ExponentialWaitStrategy {
        ExponentialWaitStrategy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_idle_wait(Duration::from_millis(self.idle_wait_ms))
    }

    pub fn retry_manager(&self, clock: Arc<dyn Clock>) -> RetryManager {
        RetryManager::new(self.retry_limit, Arc::new(self.wait_strategy()), clock)
    }

    /// Install the process log subscriber in the configured format.
    ///
    /// A subscriber installed earlier is kept.
    pub fn init_logging(&self) {
        dataspace_observability::init_with(self.log_format);
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::invalid_value(key, value, e))
}
