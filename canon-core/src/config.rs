//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Tunables for the commit coordinator and the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy for canonical-store writes, proposal resolution and
    /// the delay between judge retries.
    pub retry: RetryPolicy,
    /// Deadline for a single external judgment.
    pub judge_timeout_ms: u64,
    /// How many judgments may be in flight at once.
    pub judge_concurrency: usize,
    /// Extra attempts after a judge reports itself unavailable.
    pub judge_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            judge_timeout_ms: 10_000,
            judge_concurrency: 4,
            judge_retries: 1,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_judge_concurrency(mut self, concurrency: usize) -> Self {
        self.judge_concurrency = concurrency;
        self
    }

    pub fn with_judge_retries(mut self, retries: u32) -> Self {
        self.judge_retries = retries;
        self
    }

    /// Deadline for one judgment.
    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", self.retry.max_attempts));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid("retry.max_backoff_ms", self.retry.max_backoff_ms));
        }
        if self.judge_concurrency == 0 {
            return Err(invalid("judge_concurrency", self.judge_concurrency));
        }
        if self.judge_timeout_ms == 0 {
            return Err(invalid("judge_timeout_ms", self.judge_timeout_ms));
        }
        Ok(())
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CANON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "CANON_COMMIT_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "CANON_COMMIT_BACKOFF_MS")? {
            config.retry.initial_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CANON_COMMIT_MAX_BACKOFF_MS")? {
            config.retry.max_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CANON_JUDGE_TIMEOUT_MS")? {
            config.judge_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CANON_JUDGE_CONCURRENCY")? {
            config.judge_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "CANON_JUDGE_RETRIES")? {
            config.judge_retries = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn invalid(var: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(var, raw)),
    }
}
