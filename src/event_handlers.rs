//! Connection lifecycle event handlers.
//!
//! Callback-based hooks for monitoring the connection:
//!
//! - [`on_connect`](EventHandlers::on_connect): fired when the transport opens
//! - [`on_disconnect`](EventHandlers::on_disconnect): fired when the transport closes
//! - [`on_error`](EventHandlers::on_error): fired on connection errors
//! - [`on_receive`](EventHandlers::on_receive): debug hook for every inbound frame
//! - [`on_send`](EventHandlers::on_send): debug hook for every outbound frame
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_link::{EventHandlers, RelayLinkClient};
//!
//! # fn example() -> relay_link::Result<()> {
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("connected"))
//!     .on_disconnect(|reason| println!("disconnected: {}", reason))
//!     .on_error(|err| eprintln!("error (recoverable={}): {}", err.is_recoverable(), err));
//!
//! let client = RelayLinkClient::builder()
//!     .url("wss://relay.example.test/ws")
//!     .event_handlers(handlers)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::RelayLinkError;

/// Why the connection closed.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description.
    pub message: String,
    /// Transport close code, if the peer supplied one (e.g. 1000 = normal,
    /// 1006 = abnormal).
    pub code: Option<u16>,
    /// Whether the close completed a clean close handshake. Unclean closes
    /// trigger auto-reconnection; clean ones do not.
    pub was_clean: bool,
}

impl DisconnectReason {
    pub(crate) fn clean(message: impl Into<String>, code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            code,
            was_clean: true,
        }
    }

    pub(crate) fn unclean(message: impl Into<String>, code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            code,
            was_clean: false,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_disconnect callback.
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(RelayLinkError) + Send + Sync>;

/// Type alias for the on_receive / on_send debug hooks.
pub type FrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional; register only the ones you need. Handlers are
/// `Send + Sync` because they are invoked from the background connection
/// task, and they must not block.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_receive: Option<FrameCallback>,
    pub(crate) on_send: Option<FrameCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create an empty set (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked every time the transport opens,
    /// including reconnects.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the transport closes. The
    /// [`DisconnectReason`] says whether the close was clean; unclean
    /// closes are followed by reconnection attempts.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked on connection errors. Check
    /// [`RelayLinkError::is_recoverable`] to distinguish errors that
    /// auto-reconnection may resolve from terminal ones such as
    /// [`RelayLinkError::MaxAttemptsExceeded`].
    pub fn on_error(mut self, f: impl Fn(RelayLinkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a debug hook receiving the raw text of every inbound frame
    /// before parsing. Not needed for normal operation.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a debug hook receiving the raw text of every outbound
    /// frame, heartbeat probes included.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: RelayLinkError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_handlers_emit_nothing() {
        let handlers = EventHandlers::new();
        handlers.emit_connect();
        handlers.emit_disconnect(DisconnectReason::clean("bye", Some(1000)));
        handlers.emit_error(RelayLinkError::NotConnected);
        handlers.emit_receive("{}");
        handlers.emit_send("{}");
    }

    #[test]
    fn registered_handlers_fire() {
        let connects = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let connects_in = connects.clone();
        let errors_in = errors.clone();

        let handlers = EventHandlers::new()
            .on_connect(move || {
                connects_in.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                errors_in.fetch_add(1, Ordering::SeqCst);
            });

        handlers.emit_connect();
        handlers.emit_connect();
        handlers.emit_error(RelayLinkError::Transport("x".into()));

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_reason_display() {
        let reason = DisconnectReason::unclean("connection reset", Some(1006));
        assert_eq!(reason.to_string(), "connection reset (code: 1006)");
        assert!(!reason.was_clean);

        let reason = DisconnectReason::clean("client disconnected", None);
        assert_eq!(reason.to_string(), "client disconnected");
    }
}
