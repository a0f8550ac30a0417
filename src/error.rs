//! Error types for relay-link operations.

use thiserror::Error;

/// Result type for relay-link operations.
pub type Result<T> = std::result::Result<T, RelayLinkError>;

/// Errors surfaced by the relay-link client.
///
/// Transport-level failures are caught at the connection-task boundary and
/// converted into state transitions plus an observable error value; they are
/// reported through [`ConnectionStatus`](crate::models::ConnectionStatus)
/// and the `on_error` handler rather than unwinding into caller code.
#[derive(Debug, Clone, Error)]
pub enum RelayLinkError {
    /// Invalid or missing configuration (e.g. no endpoint URL). Fatal,
    /// surfaced synchronously from the builder, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connection attempt did not complete within the configured timeout.
    #[error("connection timed out: {0}")]
    ConnectTimeout(String),

    /// The underlying transport failed (handshake error, write error, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection without a clean close handshake.
    #[error("connection closed unexpectedly: {reason} (code: {code:?})")]
    UncleanClose {
        /// Close code reported by the transport, if any.
        code: Option<u16>,
        /// Human-readable close reason.
        reason: String,
    },

    /// Reconnection was abandoned after exhausting the attempt budget.
    /// Terminal until the caller invokes `connect()` / `retry()` again.
    #[error("failed to reconnect after {0} attempts")]
    MaxAttemptsExceeded(u32),

    /// A send was attempted with no open connection, queuing disabled and
    /// wait-for-connection disabled.
    #[error("not connected")]
    NotConnected,

    /// The background connection task is no longer running.
    #[error("connection task unavailable: {0}")]
    ChannelClosed(String),

    /// An outbound envelope could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RelayLinkError {
    /// Whether auto-reconnection may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayLinkError::ConnectTimeout(_)
                | RelayLinkError::Transport(_)
                | RelayLinkError::UncleanClose { .. }
        )
    }
}

impl From<serde_json::Error> for RelayLinkError {
    fn from(e: serde_json::Error) -> Self {
        RelayLinkError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(RelayLinkError::Transport("boom".into()).is_recoverable());
        assert!(RelayLinkError::ConnectTimeout("10s".into()).is_recoverable());
        assert!(RelayLinkError::UncleanClose { code: Some(1006), reason: "abnormal".into() }
            .is_recoverable());
        assert!(!RelayLinkError::Configuration("no url".into()).is_recoverable());
        assert!(!RelayLinkError::MaxAttemptsExceeded(5).is_recoverable());
        assert!(!RelayLinkError::NotConnected.is_recoverable());
    }
}
