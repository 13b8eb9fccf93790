//! Error types surfaced by the bus.
//!
//! None of these escape `publish`/`subscribe` as panics: they are returned as
//! values and recorded in the bus history.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use erpbus_core::DomainError;

/// Why a publish was not admitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The bus is not started (or already stopped).
    #[error("event bus is not running")]
    NotRunning,

    /// A required event field is missing.
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// The admission queue is at capacity.
    #[error("queue_overflow: admission queue is full ({capacity} events)")]
    QueueOverflow { capacity: usize },
}

/// Why a single handler invocation failed.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HandlerFailure {
    /// The handler returned an error.
    #[error("handler returned an error: {0}")]
    Error(String),

    /// The handler did not finish within its timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked (or its task was cancelled).
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Invalid bus configuration (usually from environment variables).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} must be greater than zero")]
    Zero { key: String },
}
