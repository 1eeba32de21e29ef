use std::time::Duration;
use thiserror::Error;

/// Failure modes of a single order-book fetch. Cloneable so a coalesced
/// in-flight fetch can fan the same failure out to every awaiting submitter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("transient upstream error: {message}")]
    Transient { message: String },

    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("circuit open, upstream considered degraded")]
    CircuitOpen,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unusable upstream response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient { message: message.into() }
    }
}

/// Hard errors of a whole calculation. Everything else degrades to a
/// partial result instead of surfacing here.
#[derive(Debug, Error)]
pub enum CalculationError {
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("invalid modifiers: {0}")]
    InvalidModifiers(String),

    #[error("market gateway exhausted: circuit open for the whole fetch phase with no usable cached data")]
    GatewayExhausted,
}
