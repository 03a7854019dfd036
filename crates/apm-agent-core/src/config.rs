// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::AgentError;
use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://localhost:8200";
const DEFAULT_SERVICE_NAME: &str = "unknown-service";
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BATCH_SIZE: usize = 500;
const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// What the reporter does when a transaction arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Evict the oldest queued transaction to admit the new one.
    #[default]
    DropOldest,
    /// Reject the new transaction.
    DropNewest,
}

impl DropPolicy {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "oldest" | "drop_oldest" => Some(DropPolicy::DropOldest),
            "newest" | "drop_newest" => Some(DropPolicy::DropNewest),
            _ => None,
        }
    }
}

/// How many times a batch is sent before it is dropped, and how long to wait
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Total attempts, no delay between them.
    Immediate(u64),
    /// Total attempts, with `attempt * delay` between them.
    LinearBackoff(u64, Duration),
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                (*attempts).max(1)
            }
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u64) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay) => {
                delay.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF)
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Collector base URL
    pub server_url: String,
    /// Service name reported with every payload
    pub service_name: String,
    /// Bearer token sent to the collector
    pub secret_token: Option<String>,
    /// Instrumentor keys to activate at start
    pub enabled_injectors: BTreeSet<String>,
    /// Upper bound on how long a transaction waits in the queue
    pub flush_interval: Duration,
    /// Transactions per collector request
    pub max_batch_size: usize,
    /// Reporter queue capacity
    pub max_queue_size: usize,
    pub drop_policy: DropPolicy,
    pub retry_strategy: RetryStrategy,
    /// Bound on each collector request
    pub request_timeout: Duration,
    /// Bound on the final drain when the agent stops
    pub shutdown_timeout: Duration,
    pub capture_backtraces: bool,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            secret_token: None,
            enabled_injectors: BTreeSet::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            drop_policy: DropPolicy::default(),
            retry_strategy: RetryStrategy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            capture_backtraces: true,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Default configuration with the given instrumentors enabled.
    pub fn with_enabled_injectors<I, S>(injectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled_injectors: injectors.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration, AgentError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| AgentError::InvalidConfig(format!("{key}: {e}"))),
                None => Ok(default),
            }
        };
        let count = |key: &str, default: usize| -> Result<usize, AgentError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| AgentError::InvalidConfig(format!("{key}: {e}"))),
                None => Ok(default),
            }
        };

        let enabled_injectors = lookup("APM_ENABLED_INJECTORS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let drop_policy = match lookup("APM_DROP_POLICY") {
            Some(value) => DropPolicy::parse(&value).ok_or_else(|| {
                AgentError::InvalidConfig(format!(
                    "Invalid drop policy '{value}'. Must be one of: oldest, newest"
                ))
            })?,
            None => defaults.drop_policy,
        };

        let attempts = match lookup("APM_RETRY_ATTEMPTS") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|e| AgentError::InvalidConfig(format!("APM_RETRY_ATTEMPTS: {e}")))?,
            None => defaults.retry_strategy.attempts(),
        };
        let backoff = millis("APM_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF)?;
        let retry_strategy = if backoff.is_zero() {
            RetryStrategy::Immediate(attempts)
        } else {
            RetryStrategy::LinearBackoff(attempts, backoff)
        };

        let config = Self {
            server_url: lookup("APM_SERVER_URL").unwrap_or(defaults.server_url),
            service_name: lookup("APM_SERVICE_NAME").unwrap_or(defaults.service_name),
            secret_token: lookup("APM_SECRET_TOKEN").filter(|token| !token.is_empty()),
            enabled_injectors,
            flush_interval: millis("APM_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            max_batch_size: count("APM_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            max_queue_size: count("APM_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            drop_policy,
            retry_strategy,
            request_timeout: millis("APM_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            shutdown_timeout: millis("APM_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            capture_backtraces: lookup("APM_CAPTURE_BACKTRACES")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(defaults.capture_backtraces),
            log_level: lookup("APM_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        let url = reqwest::Url::parse(&self.server_url).map_err(|e| {
            AgentError::InvalidConfig(format!("Invalid server URL '{}': {e}", self.server_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AgentError::InvalidConfig(format!(
                "Server URL must be http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.service_name.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "Service name cannot be empty".to_string(),
            ));
        }

        if self.max_batch_size == 0 || self.max_queue_size == 0 {
            return Err(AgentError::InvalidConfig(
                "Batch size and queue size must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_size > self.max_queue_size {
            return Err(AgentError::InvalidConfig(format!(
                "Batch size {} exceeds queue size {}",
                self.max_batch_size, self.max_queue_size
            )));
        }

        if self.flush_interval.is_zero()
            || self.request_timeout.is_zero()
            || self.shutdown_timeout.is_zero()
        {
            return Err(AgentError::InvalidConfig(
                "Flush interval and timeouts must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
