//! Bus configuration: defaults, `with_*` builders, and `ERPBUS_*` environment overrides.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Capacities of the in-memory history buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    pub history: usize,
    pub failed: usize,
    pub performance: usize,
    pub replay: usize,
    pub dead_letter: usize,
    /// Admitted events waiting for the next webhook delivery tick
    pub webhook_outbox: usize,
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self {
            history: 1000,
            failed: 1000,
            performance: 1000,
            replay: 1000,
            dead_letter: 1000,
            webhook_outbox: 1000,
        }
    }
}

/// Construction-time configuration of an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Admission queue capacity
    pub max_queue_size: usize,
    /// Number of concurrent dispatcher workers
    pub worker_count: usize,
    /// Move events with exhausted retries to the dead-letter buffer
    pub enable_dead_letter: bool,
    /// How long a worker waits on an empty queue before re-checking shutdown
    pub poll_interval: Duration,
    pub buffers: BufferSizes,
    pub stats_interval: Duration,
    pub dead_letter_interval: Duration,
    pub webhook_interval: Duration,
    pub retry: RetryPolicy,
    /// Handler timeout used when a registration does not set one
    pub default_handler_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            worker_count: 4,
            enable_dead_letter: true,
            poll_interval: Duration::from_millis(250),
            buffers: BufferSizes::default(),
            stats_interval: Duration::from_secs(60),
            dead_letter_interval: Duration::from_secs(300),
            webhook_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            default_handler_timeout: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.enable_dead_letter = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_buffers(mut self, buffers: BufferSizes) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_dead_letter_interval(mut self, interval: Duration) -> Self {
        self.dead_letter_interval = interval;
        self
    }

    pub fn with_webhook_interval(mut self, interval: Duration) -> Self {
        self.webhook_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_default_handler_timeout(mut self, timeout: Duration) -> Self {
        self.default_handler_timeout = timeout;
        self
    }

    /// Defaults overridden by `ERPBUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `ERPBUS_*` key.
    ///
    /// | key | meaning |
    /// |-----|---------|
    /// | `ERPBUS_MAX_QUEUE_SIZE` | queue capacity |
    /// | `ERPBUS_WORKER_COUNT` | dispatcher workers |
    /// | `ERPBUS_ENABLE_DEAD_LETTER` | `true`/`false` |
    /// | `ERPBUS_POLL_INTERVAL_MS` | worker poll interval |
    /// | `ERPBUS_REPLAY_BUFFER_SIZE` | replay buffer capacity |
    /// | `ERPBUS_HISTORY_SIZE` | history/failed/performance capacity |
    /// | `ERPBUS_DEAD_LETTER_SIZE` | dead-letter capacity |
    /// | `ERPBUS_STATS_INTERVAL_SECS` | stats aggregation period |
    /// | `ERPBUS_RETRY_BASE_MS` | retry base delay |
    /// | `ERPBUS_RETRY_MAX_SECS` | retry delay cap |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_positive::<usize>(&lookup, "ERPBUS_MAX_QUEUE_SIZE")? {
            config.max_queue_size = v;
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "ERPBUS_WORKER_COUNT")? {
            config.worker_count = v;
        }
        if let Some(v) = parse::<bool>(&lookup, "ERPBUS_ENABLE_DEAD_LETTER")? {
            config.enable_dead_letter = v;
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "ERPBUS_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "ERPBUS_REPLAY_BUFFER_SIZE")? {
            config.buffers.replay = v;
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "ERPBUS_HISTORY_SIZE")? {
            config.buffers.history = v;
            config.buffers.failed = v;
            config.buffers.performance = v;
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "ERPBUS_DEAD_LETTER_SIZE")? {
            config.buffers.dead_letter = v;
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "ERPBUS_STATS_INTERVAL_SECS")? {
            config.stats_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "ERPBUS_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "ERPBUS_RETRY_MAX_SECS")? {
            config.retry.max_delay = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: core::fmt::Display,
{
    match parse::<T>(lookup, key)? {
        Some(v) if v == T::default() => Err(ConfigError::Zero {
            key: key.to_string(),
        }),
        other => Ok(other),
    }
}
