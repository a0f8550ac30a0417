//! Main relay-link client with builder pattern.
//!
//! The client is an explicitly constructed instance with clear ownership:
//! whoever builds it owns it, hands it to a composition root, and the
//! background connection task dies with it. There is no process-wide
//! singleton.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{connection_task, ConnCmd, TaskContext, COMMAND_CHANNEL_CAPACITY};
use crate::error::{RelayLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::gate::ReadinessGate;
use crate::handlers::{HandlerRegistry, MessageHandler, Subscription, SubscriptionKey};
use crate::history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
use crate::models::{
    ConnectionOptions, ConnectionState, ConnectionStatus, Envelope, QueuedMessage, SendOptions,
    SendOutcome,
};
use crate::queue::{MessageQueue, DEFAULT_QUEUE_CAPACITY};
use crate::transport::{normalize_ws_url, Connector, WsConnector};

/// Resilient persistent-connection client.
///
/// Maintains a single logical duplex message channel to a remote endpoint,
/// transparently surviving drops, slow connects and backpressure. Built via
/// [`RelayLinkClient::builder`]; requires a running Tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use relay_link::{RelayLinkClient, SendOptions};
///
/// # async fn example() -> relay_link::Result<()> {
/// let client = RelayLinkClient::builder()
///     .url("wss://relay.example.test/ws")
///     .build()?;
///
/// client.connect().await?;
///
/// let _sub = client.subscribe("utxo", |data| {
///     println!("utxo update: {}", data);
/// });
///
/// client
///     .send("query", serde_json::json!({"tag": "snapshot"}), SendOptions::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RelayLinkClient {
    cmd_tx: mpsc::Sender<ConnCmd>,
    status_rx: watch::Receiver<ConnectionStatus>,
    gate: ReadinessGate,
    queue: Arc<Mutex<MessageQueue>>,
    registry: Arc<RwLock<HandlerRegistry>>,
    history: Arc<Mutex<MessageHistory>>,
    _task: JoinHandle<()>,
}

impl RelayLinkClient {
    /// Create a new builder for configuring the client.
    pub fn builder() -> RelayLinkClientBuilder {
        RelayLinkClientBuilder::new()
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Open the connection.
    ///
    /// Idempotent: when already connected this returns immediately; when a
    /// connect is already in flight the call joins it rather than opening a
    /// second transport. Resolves once the transport opens and queued
    /// messages have been replayed; fails with the attempt's error if the
    /// cycle fails (auto-reconnection continues in the background while
    /// attempts remain). An explicit call resets the reconnect-attempt
    /// counter.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(ConnCmd::Connect { ack: ack_tx }).await?;
        ack_rx
            .await
            .map_err(|_| RelayLinkError::ChannelClosed("connection task stopped".to_string()))?;
        self.gate.settled().await
    }

    /// Re-attempt the connection after a terminal
    /// [`MaxAttemptsExceeded`](RelayLinkError::MaxAttemptsExceeded).
    /// Identical to [`connect`](Self::connect); it exists so callers can
    /// make the user-initiated retry explicit.
    pub async fn retry(&self) -> Result<()> {
        self.connect().await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Cancels every outstanding timer (connect timeout, heartbeat,
    /// reconnect delay), rejects any pending readiness waiter and resets
    /// the attempt counter. Queued messages and subscriptions are kept.
    pub async fn disconnect(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(ConnCmd::Disconnect { ack: ack_tx }).await?;
        ack_rx
            .await
            .map_err(|_| RelayLinkError::ChannelClosed("connection task stopped".to_string()))
    }

    /// Wait until the transport is open, bounded by `timeout`.
    ///
    /// Resolves immediately when already connected. Fails with the cycle's
    /// error when a connect attempt settles unsuccessfully while waiting,
    /// and with [`ConnectTimeout`](RelayLinkError::ConnectTimeout) exactly
    /// at `timeout` when nothing settles in time.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        self.gate.wait(timeout).await
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send a typed message.
    ///
    /// When connected the envelope is serialized and transmitted, yielding
    /// [`SendOutcome::Sent`]. Otherwise, depending on `options`: the call
    /// waits for an in-flight connection and retries once, queues the
    /// message for replay on reconnect ([`SendOutcome::Queued`]), or
    /// reports [`SendOutcome::Failed`]. Transport-level send failures are
    /// reported through the outcome, never as a panic.
    pub async fn send(
        &self,
        kind: impl Into<String>,
        data: Value,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let envelope = Envelope::new(kind, data);

        if self.state() != ConnectionState::Connected {
            if options.wait_for_connection {
                match self.gate.wait(options.wait_timeout()).await {
                    // Connection became ready: retry the send once.
                    Ok(()) => return self.transmit(envelope, &options).await,
                    Err(e) => {
                        log::debug!("[relay-link] Send wait for connection failed: {}", e);
                        return Ok(self.queue_or_fail(envelope, &options));
                    }
                }
            }
            return Ok(self.queue_or_fail(envelope, &options));
        }

        self.transmit(envelope, &options).await
    }

    /// Send a pre-serialized frame verbatim. Only succeeds while connected;
    /// raw frames are never queued.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<SendOutcome> {
        if self.state() != ConnectionState::Connected {
            return Ok(SendOutcome::Failed);
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::Transmit {
            text: text.into(),
            queue_fallback: None,
            result_tx,
        })
        .await?;
        result_rx
            .await
            .map_err(|_| RelayLinkError::ChannelClosed("connection task stopped".to_string()))
    }

    async fn transmit(&self, envelope: Envelope, options: &SendOptions) -> Result<SendOutcome> {
        let text = serde_json::to_string(&envelope)?;
        let queue_fallback = options
            .queue_if_offline
            .then(|| QueuedMessage::new(envelope));
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::Transmit {
            text,
            queue_fallback,
            result_tx,
        })
        .await?;
        result_rx
            .await
            .map_err(|_| RelayLinkError::ChannelClosed("connection task stopped".to_string()))
    }

    fn queue_or_fail(&self, envelope: Envelope, options: &SendOptions) -> SendOutcome {
        if options.queue_if_offline {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.enqueue(QueuedMessage::new(envelope));
            SendOutcome::Queued
        } else {
            SendOutcome::Failed
        }
    }

    async fn command(&self, cmd: ConnCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RelayLinkError::ChannelClosed("connection task stopped".to_string()))
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe a handler to messages with a specific type tag. The
    /// returned [`Subscription`] is the capability to unsubscribe.
    pub fn subscribe(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let kind = kind.into();
        let handler: MessageHandler = Arc::new(handler);
        let id = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.subscribe(&kind, handler)
        };
        Subscription::new(self.registry.clone(), SubscriptionKey::Typed { kind, id })
    }

    /// Subscribe a handler to every message regardless of type. Global
    /// handlers observe every message that typed handlers observe, and run
    /// before them.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: MessageHandler = Arc::new(handler);
        let id = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.subscribe_all(handler)
        };
        Subscription::new(self.registry.clone(), SubscriptionKey::Global { id })
    }

    /// Remove every subscription atomically.
    pub fn clear_handlers(&self) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.clear();
    }

    // ── Queue and history ───────────────────────────────────────────────

    /// Number of messages queued for replay.
    pub fn queue_size(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Discard every queued message.
    pub fn clear_queue(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The most recently received envelope, if any.
    pub fn last_message(&self) -> Option<Envelope> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
    }

    /// Snapshot of recently received envelopes, oldest first.
    pub fn message_history(&self) -> Vec<Envelope> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Discard the received-message history.
    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // ── Observability ───────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current status: state, last connection error and connect progress.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch status changes. The receiver yields a fresh
    /// [`ConnectionStatus`] on every transition; this is the
    /// subscribe-to-state-changes capability for reactive callers.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }
}

impl Drop for RelayLinkClient {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        let _ = self.cmd_tx.try_send(ConnCmd::Shutdown);
    }
}

impl std::fmt::Debug for RelayLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLinkClient")
            .field("state", &self.state())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

/// Builder for configuring [`RelayLinkClient`] instances.
pub struct RelayLinkClientBuilder {
    options: ConnectionOptions,
    event_handlers: EventHandlers,
    connector: Option<Arc<dyn Connector>>,
}

impl RelayLinkClientBuilder {
    fn new() -> Self {
        Self {
            options: ConnectionOptions::default(),
            event_handlers: EventHandlers::default(),
            connector: None,
        }
    }

    /// Set the endpoint URL. Required.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = url.into();
        self
    }

    /// Replace the whole option set at once, including the URL.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Begin connecting as soon as the client is built.
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.options.auto_connect = auto_connect;
        self
    }

    /// Base delay between reconnection attempts.
    pub fn reconnect_base_interval(mut self, interval: Duration) -> Self {
        self.options = self.options.with_reconnect_base_interval(interval);
        self
    }

    /// Reconnection attempt budget.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.max_reconnect_attempts = attempts;
        self
    }

    /// Heartbeat interval. Zero disables the heartbeat.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options = self.options.with_heartbeat_interval(interval);
        self
    }

    /// Per-attempt connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_connect_timeout(timeout);
        self
    }

    /// WebSocket subprotocols offered during the handshake.
    pub fn subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.options.subprotocols = subprotocols;
        self
    }

    /// Elevate per-frame logging to debug level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    /// Register connection lifecycle hooks.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Replace the transport connector. Any conforming transport works;
    /// the default is the WebSocket connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the client and spawn its background connection task.
    ///
    /// Must be called within a Tokio runtime. Fails synchronously with
    /// [`Configuration`](RelayLinkError::Configuration) when the URL is
    /// missing or invalid.
    pub fn build(self) -> Result<RelayLinkClient> {
        let url = normalize_ws_url(&self.options.url)?;

        let queue = Arc::new(Mutex::new(MessageQueue::new(DEFAULT_QUEUE_CAPACITY)));
        let registry = Arc::new(RwLock::new(HandlerRegistry::new()));
        let history = Arc::new(Mutex::new(MessageHistory::new(DEFAULT_HISTORY_CAPACITY)));
        let gate = ReadinessGate::new();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector) as Arc<dyn Connector>);

        let ctx = TaskContext {
            connector,
            options: self.options,
            url,
            queue: queue.clone(),
            registry: registry.clone(),
            history: history.clone(),
            gate: gate.clone(),
            status_tx,
            handlers: self.event_handlers,
        };
        let task = tokio::spawn(connection_task(cmd_rx, ctx));

        Ok(RelayLinkClient {
            cmd_tx,
            status_rx,
            gate,
            queue,
            registry,
            history,
            _task: task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_url() {
        // Outside a runtime: the URL check fires before the task spawn.
        let result = RelayLinkClient::builder().build();
        assert!(matches!(result, Err(RelayLinkError::Configuration(_))));
    }

    #[test]
    fn build_rejects_bad_scheme() {
        let result = RelayLinkClient::builder().url("ftp://example.test").build();
        assert!(matches!(result, Err(RelayLinkError::Configuration(_))));
    }

    #[tokio::test]
    async fn build_starts_disconnected_without_auto_connect() {
        let client = RelayLinkClient::builder()
            .url("ws://localhost:9")
            .auto_connect(false)
            .build()
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.queue_size(), 0);
        assert!(client.last_message().is_none());
    }
}
