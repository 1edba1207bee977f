//! Error types for the task transport.

use std::time::Duration;

/// Top-level error type for the transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

/// Connection- and channel-level faults.
///
/// These are connectivity problems, never data problems — a payload that
/// fails to decode is a [`WireError`], and the consumer loop must not treat
/// it as a reason to reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker unreachable for {elapsed:?} (budget {budget:?})")]
    ConnectionTimeout { elapsed: Duration, budget: Duration },

    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),

    #[error("Channel closed unexpectedly: {0}")]
    ChannelClosed(String),

    #[error("Queue {name} already declared with different properties: {detail}")]
    QueueConflict { name: String, detail: String },

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
}

impl TransportError {
    /// Whether `connect()` may retry after this error within its budget.
    ///
    /// Only broker unavailability is retried; property conflicts and closed
    /// channels surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::ConnectionRefused(_))
    }
}

/// Data-level decode failures (malformed messages).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Malformed payload: {0}")]
    Payload(serde_json::Error),

    #[error("Malformed metadata after end-of-stream: {0}")]
    Metadata(serde_json::Error),

    #[error("Failed to serialize payload: {0}")]
    Encode(serde_json::Error),
}

/// Result type alias for the transport.
pub type Result<T> = std::result::Result<T, Error>;
