//! Data model for the relay-link client.
//!
//! Contains the wire envelope, queued-message record, connection state and
//! status types, and the configuration structs for connection and send
//! behavior.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::RelayLinkError;

/// Current time in millis since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Wire envelope ───────────────────────────────────────────────────────────

/// The wrapper around every application message.
///
/// On the wire this is a JSON object with a `type` routing tag, an opaque
/// `data` payload and a `timestamp` in millis. The timestamp is assigned
/// locally on both send and receive; a timestamp arriving from the wire is
/// never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing tag. The client never interprets payload semantics beyond
    /// dispatching by this tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque, already-structured payload.
    pub data: Value,
    /// Millis since Unix epoch, assigned locally.
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    /// Create an envelope stamped with the current local time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: now_ms(),
        }
    }
}

/// An envelope held in the outbound queue while disconnected.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The message awaiting replay.
    pub envelope: Envelope,
    /// Failed replay attempts so far. The count persists across reconnect
    /// cycles; it never restarts at zero.
    pub retries: u32,
}

impl QueuedMessage {
    pub(crate) fn new(envelope: Envelope) -> Self {
        Self { envelope, retries: 0 }
    }
}

// ── Connection state ────────────────────────────────────────────────────────

/// Lifecycle state of the connection. Exactly one state holds at any
/// instant; the connection task owns all transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open, no attempt in flight.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The transport is open and usable.
    Connected,
    /// The last attempt failed with a transport error, or reconnection was
    /// abandoned after exhausting the attempt budget.
    Errored,
    /// The last attempt did not complete within the connect timeout.
    TimedOut,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Errored => "error",
            ConnectionState::TimedOut => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Observable connection status: the state machine's current state, the
/// last connection error (if any), and a coarse connect progress value.
///
/// Obtained via [`RelayLinkClient::status`](crate::client::RelayLinkClient::status)
/// or watched via [`RelayLinkClient::watch_status`](crate::client::RelayLinkClient::watch_status).
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Most recent connection error. Cleared on successful open.
    pub error: Option<RelayLinkError>,
    /// Connect progress, 0-100. Ticks toward 90 while connecting, 100 once
    /// open, back to 0 on close or failure.
    pub progress: u8,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: None,
            progress: 0,
        }
    }
}

// ── Connection options ──────────────────────────────────────────────────────

/// Configuration for connection behavior.
///
/// Supplied once when the client is built and immutable afterwards; a new
/// option set requires building a new client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Endpoint URL. `ws://` / `wss://` (plain `http(s)://` URLs are mapped
    /// to their WebSocket scheme). Required.
    #[serde(default)]
    pub url: String,

    /// Begin the first connect cycle as soon as the client is built.
    /// Default: true
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,

    /// Base delay in milliseconds between reconnection attempts. The actual
    /// delay grows by 1.5x per attempt, capped at 30 seconds.
    /// Default: 3000ms
    #[serde(default = "default_reconnect_base_interval_ms")]
    pub reconnect_base_interval_ms: u64,

    /// Maximum number of reconnection attempts before giving up.
    /// Default: 5
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Interval in milliseconds between liveness probes while connected.
    /// Set to 0 to disable the heartbeat.
    /// Default: 30000ms
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout in milliseconds for a single connection attempt.
    /// Default: 10000ms
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// WebSocket subprotocols offered during the handshake.
    #[serde(default)]
    pub subprotocols: Vec<String>,

    /// Elevate per-frame logging (every send/receive) to debug level.
    /// Lifecycle events are logged regardless.
    #[serde(default)]
    pub debug: bool,
}

fn default_auto_connect() -> bool {
    true
}

fn default_reconnect_base_interval_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            auto_connect: true,
            reconnect_base_interval_ms: 3000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            subprotocols: Vec::new(),
            debug: false,
        }
    }
}

impl ConnectionOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Enable or disable connecting as soon as the client is built.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set the base reconnect delay.
    pub fn with_reconnect_base_interval(mut self, interval: Duration) -> Self {
        self.reconnect_base_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum number of reconnection attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the heartbeat interval. Zero disables the heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the WebSocket subprotocols offered during the handshake.
    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Elevate per-frame logging to debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub(crate) fn reconnect_base_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_interval_ms)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Send options / outcome ──────────────────────────────────────────────────

/// Per-call configuration for [`send`](crate::client::RelayLinkClient::send).
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Queue the message for replay on reconnect when it cannot be
    /// transmitted. Default: true
    pub queue_if_offline: bool,

    /// When not connected, suspend until the connection is ready (bounded by
    /// [`wait_timeout_ms`](Self::wait_timeout_ms)) and then retry the send
    /// once. Default: true
    pub wait_for_connection: bool,

    /// Upper bound on the wait-for-connection suspension, in milliseconds.
    /// Default: 5000ms
    pub wait_timeout_ms: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            queue_if_offline: true,
            wait_for_connection: true,
            wait_timeout_ms: 5000,
        }
    }
}

impl SendOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable queueing when offline.
    pub fn with_queue_if_offline(mut self, queue: bool) -> Self {
        self.queue_if_offline = queue;
        self
    }

    /// Enable or disable waiting for an in-flight connection.
    pub fn with_wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }

    /// Bound the wait-for-connection suspension.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub(crate) fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// What happened to a message handed to `send`.
///
/// Send failures are reported through this value, never as a panic or an
/// unwound error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Serialized and handed to the transport.
    Sent,
    /// Could not be transmitted now; queued for replay on reconnect.
    Queued,
    /// Could not be transmitted and queuing was not permitted.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new("utxo", serde_json::json!({"n": 1}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"utxo\""));
        assert!(text.contains("\"data\""));
        assert!(text.contains("\"timestamp\""));
    }

    #[test]
    fn envelope_requires_type_and_data() {
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"a","data":{}}"#).is_ok());
        // Timestamp is optional on the wire; it gets reassigned locally anyway.
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"a","data":1,"timestamp":5}"#).is_ok());
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"a"}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"{"data":{}}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"{"type":1,"data":{}}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn option_defaults() {
        let opts = ConnectionOptions::default();
        assert!(opts.auto_connect);
        assert_eq!(opts.reconnect_base_interval_ms, 3000);
        assert_eq!(opts.max_reconnect_attempts, 5);
        assert_eq!(opts.heartbeat_interval_ms, 30_000);
        assert_eq!(opts.connect_timeout_ms, 10_000);
        assert!(opts.subprotocols.is_empty());
        assert!(!opts.debug);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ConnectionOptions =
            serde_json::from_str(r#"{"url":"wss://example.test/ws"}"#).unwrap();
        assert_eq!(opts.url, "wss://example.test/ws");
        assert_eq!(opts.max_reconnect_attempts, 5);
    }

    #[test]
    fn send_option_defaults() {
        let opts = SendOptions::default();
        assert!(opts.queue_if_offline);
        assert!(opts.wait_for_connection);
        assert_eq!(opts.wait_timeout_ms, 5000);
    }
}
