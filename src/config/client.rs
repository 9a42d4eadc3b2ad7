//! Client options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::connection::RetryPolicy;

/// Prefix of every environment variable read by [`ClientOptions::from_env`].
pub const ENV_PREFIX: &str = "STANCHION_";

/// Options of a [`crate::core::QueueClient`]. Immutable once the client is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Parallel fetch-and-process cycles per worker loop.
    pub concurrency: usize,
    /// Key of the broker list holding the jobs.
    pub queue_key: String,
    /// Reconnection attempts before a connection is considered lost for good.
    pub max_retries: u32,
    /// Broker address, e.g. `redis://127.0.0.1:6379`.
    pub address: String,
    /// Blocking pop timeout. `None` waits indefinitely.
    pub pop_timeout_ms: Option<u64>,
    /// Delay before the first reconnection retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound of any reconnection delay.
    pub retry_max_delay_ms: u64,
    /// Interval of the idle-session liveness probe.
    pub health_check_interval_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queue_key: "stanchion:queue".into(),
            max_retries: 6,
            address: "redis://127.0.0.1:6379".into(),
            pop_timeout_ms: None,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2000,
            health_check_interval_ms: 1000,
        }
    }
}

impl ClientOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency ceiling.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the queue key.
    #[must_use]
    pub fn with_queue_key(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self
    }

    /// Set the reconnection retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the broker address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Make blocking pops give up after `timeout`.
    #[must_use]
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the reconnection backoff bounds.
    #[must_use]
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.retry_max_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the liveness probe interval.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Blocking pop timeout as a duration.
    #[must_use]
    pub fn pop_timeout(&self) -> Option<Duration> {
        self.pop_timeout_ms.map(Duration::from_millis)
    }

    /// Liveness probe interval as a duration.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Reconnection policy derived from these options.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Validate option values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be greater than 0".into());
        }
        if self.queue_key.trim().is_empty() {
            return Err("queue_key must not be empty".into());
        }
        if self.address.trim().is_empty() {
            return Err("address must not be empty".into());
        }
        if self.pop_timeout_ms == Some(0) {
            return Err("pop_timeout_ms must be greater than 0 when set".into());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err("retry_base_delay_ms must not exceed retry_max_delay_ms".into());
        }
        if self.health_check_interval_ms == 0 {
            return Err("health_check_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse options from a JSON string and validate. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let options: Self =
            serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        options.validate()?;
        Ok(options)
    }

    /// Load a `.env` file if present, then read `STANCHION_*` variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or a validation message.
    pub fn from_env() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(format!("failed to load .env: {e}"));
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build options from an arbitrary variable source, e.g. a map in tests.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        let mut options = Self::default();
        if let Some(v) = var("CONCURRENCY") {
            options.concurrency = parse_var("CONCURRENCY", &v)?;
        }
        if let Some(v) = var("QUEUE_KEY") {
            options.queue_key = v;
        }
        if let Some(v) = var("MAX_RETRIES") {
            options.max_retries = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("ADDRESS") {
            options.address = v;
        }
        if let Some(v) = var("POP_TIMEOUT_MS") {
            options.pop_timeout_ms = Some(parse_var("POP_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            options.retry_base_delay_ms = parse_var("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = var("RETRY_MAX_DELAY_MS") {
            options.retry_max_delay_ms = parse_var("RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = var("HEALTH_CHECK_INTERVAL_MS") {
            options.health_check_interval_ms = parse_var("HEALTH_CHECK_INTERVAL_MS", &v)?;
        }
        options.validate()?;
        Ok(options)
    }
}

fn parse_var<T>(suffix: &str, value: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{suffix}: {e}"))
}
