// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants;
use crate::errors::ConfigError;
use std::env;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// How a batch is retried after a transient transport failure.
///
/// The count is the number of retries after the first attempt, so
/// `Immediate(2)` sends a batch at most three times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate(u64),
    /// Retries with a delay of `delay_ms * retry_number` milliseconds.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    #[must_use]
    pub fn max_retries(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(retries) | RetryStrategy::LinearBackoff(retries, _) => {
                *retries
            }
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u64) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => {
                Duration::from_millis(delay_ms.saturating_mul(retry))
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(
            constants::DEFAULT_MAX_RETRIES,
            constants::DEFAULT_RETRY_DELAY_MS,
        )
    }
}

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target index or data stream name
    pub index_name: String,
    /// Seal a batch once its wire size reaches this many bytes
    pub flush_bytes: usize,
    /// Seal a batch once its first document is this old
    pub flush_interval: Duration,
    /// Source tags admitted by the entry filter. Empty means the defaults.
    pub valid_sources: Vec<String>,
    /// Base URL of the Elasticsearch cluster
    pub elasticsearch_url: String,
    /// API key sent as `Authorization: ApiKey <key>`
    pub elasticsearch_api_key: String,
    /// Number of concurrent delivery workers
    pub num_workers: usize,
    /// Sealed batches buffered between the controller and the workers
    pub queue_capacity: usize,
    pub retry_strategy: RetryStrategy,
    /// Timeout for a single bulk request
    pub request_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_name: constants::DEFAULT_INDEX_NAME.to_string(),
            flush_bytes: constants::DEFAULT_FLUSH_BYTES,
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            valid_sources: constants::DEFAULT_VALID_SOURCES
                .iter()
                .map(ToString::to_string)
                .collect(),
            elasticsearch_url: String::new(),
            elasticsearch_api_key: String::new(),
            num_workers: constants::DEFAULT_NUM_WORKERS,
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            retry_strategy: RetryStrategy::default(),
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `lookup`, falling back to defaults for
    /// variables that are unset or unparsable. Does not validate.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parse_or = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let valid_sources = lookup("LOGSERVICE_VALID_SOURCES")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|sources| !sources.is_empty())
            .unwrap_or(defaults.valid_sources);

        let retry_strategy = RetryStrategy::LinearBackoff(
            parse_or("LOGSERVICE_MAX_RETRIES", constants::DEFAULT_MAX_RETRIES),
            parse_or("LOGSERVICE_RETRY_DELAY_MS", constants::DEFAULT_RETRY_DELAY_MS),
        );

        Self {
            index_name: lookup("LOGSERVICE_INDEX").unwrap_or(defaults.index_name),
            flush_bytes: lookup("LOGSERVICE_FLUSH_BYTES")
                .and_then(|val| val.trim().parse::<usize>().ok())
                .unwrap_or(defaults.flush_bytes),
            flush_interval: lookup("LOGSERVICE_FLUSH_INTERVAL_MS")
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            valid_sources,
            elasticsearch_url: lookup("ELASTICSEARCH_URL").unwrap_or_default(),
            elasticsearch_api_key: lookup("ELASTICSEARCH_API_KEY").unwrap_or_default(),
            num_workers: lookup("LOGSERVICE_WORKERS")
                .and_then(|val| val.trim().parse::<usize>().ok())
                .unwrap_or(defaults.num_workers),
            queue_capacity: defaults.queue_capacity,
            retry_strategy,
            request_timeout: Duration::from_secs(parse_or(
                "LOGSERVICE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            log_level: lookup("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        }
    }

    /// Validate the configuration, including the remote endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elasticsearch_url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        if self.elasticsearch_api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        self.validate_pipeline()
    }

    /// Validate the settings the pipeline itself depends on, ignoring the
    /// remote endpoint. Used when a transport is supplied directly.
    pub fn validate_pipeline(&self) -> Result<(), ConfigError> {
        if self.index_name.trim().is_empty() {
            return Err(ConfigError::MissingIndex);
        }

        if self.flush_bytes == 0 {
            return Err(ConfigError::Invalid(
                "flush bytes must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "worker count must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
