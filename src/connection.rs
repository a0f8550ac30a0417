//! Background connection task.
//!
//! A single task exclusively owns the transport handle and the connection
//! state machine. It multiplexes:
//!
//! - Commands from the public API (connect/disconnect/transmit/shutdown)
//! - Inbound transport events (frames, closes, errors)
//! - Timers (connect timeout, progress ticks, heartbeat, reconnect delay)
//!
//! Every state transition completes fully before the task yields back to
//! the scheduler, so no locking discipline is needed for the state itself.
//! The message queue, handler registry and history are shared structures
//! that outlive individual connection attempts: queued messages and
//! subscriptions survive a drop by design.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;

use crate::backoff::BackoffPolicy;
use crate::error::RelayLinkError;
use crate::event_handlers::{DisconnectReason, EventHandlers};
use crate::gate::ReadinessGate;
use crate::handlers::HandlerRegistry;
use crate::history::MessageHistory;
use crate::models::{
    now_ms, ConnectionOptions, ConnectionState, ConnectionStatus, Envelope, QueuedMessage,
    SendOutcome,
};
use crate::queue::{MessageQueue, MAX_ENTRY_RETRIES};
use crate::transport::{Connector, TransportEvent, TransportLink};

/// Capacity of the command channel between the public API and the task.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 256;

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background connection task.
pub(crate) enum ConnCmd {
    /// Begin a connect cycle, or join the one in flight. Acknowledged once
    /// the readiness gate for the cycle is armed (or already open), so the
    /// caller can await the gate without racing the task.
    Connect { ack: oneshot::Sender<()> },
    /// Close the transport, cancel every outstanding timer, stop
    /// reconnecting and reset the attempt counter.
    Disconnect { ack: oneshot::Sender<()> },
    /// Transmit a pre-serialized frame. When transmission is impossible the
    /// fallback (if any) is enqueued for replay and the reply is `Queued`;
    /// with no fallback the reply is `Failed`.
    Transmit {
        text: String,
        queue_fallback: Option<QueuedMessage>,
        result_tx: oneshot::Sender<SendOutcome>,
    },
    /// Stop the task.
    Shutdown,
}

// ── Task context ────────────────────────────────────────────────────────────

/// Everything the connection task shares with the client handle.
pub(crate) struct TaskContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) options: ConnectionOptions,
    /// Normalized endpoint URL, validated at build time.
    pub(crate) url: String,
    pub(crate) queue: Arc<Mutex<MessageQueue>>,
    pub(crate) registry: Arc<RwLock<HandlerRegistry>>,
    pub(crate) history: Arc<Mutex<MessageHistory>>,
    pub(crate) gate: ReadinessGate,
    pub(crate) status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) handlers: EventHandlers,
}

impl TaskContext {
    fn set_status(&self, state: ConnectionState, error: Option<RelayLinkError>, progress: u8) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.error = error;
            status.progress = progress;
        });
    }

    fn tick_progress(&self, progress: u8) {
        self.status_tx.send_modify(|status| status.progress = progress);
    }

    fn enqueue(&self, message: QueuedMessage) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.enqueue(message);
    }

    /// Resolution for a transmit that cannot reach the wire.
    fn queue_or_fail(&self, fallback: Option<QueuedMessage>) -> SendOutcome {
        match fallback {
            Some(message) => {
                log::debug!(
                    "[relay-link] Queued '{}' message for replay",
                    message.envelope.kind
                );
                self.enqueue(message);
                SendOutcome::Queued
            }
            None => SendOutcome::Failed,
        }
    }

    fn frame_sent(&self, text: &str) {
        self.handlers.emit_send(text);
        if self.options.debug {
            log::debug!("[relay-link] -> {}", text);
        }
    }

    /// Parse and dispatch one inbound frame. Malformed frames are dropped
    /// here; nothing on this path may panic or reach subscribers.
    fn dispatch_frame(&self, text: &str) {
        self.handlers.emit_receive(text);
        if self.options.debug {
            log::debug!("[relay-link] <- {}", text);
        }

        let mut envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[relay-link] Dropping malformed frame: {}", e);
                return;
            }
        };
        // Local receive time; wire timestamps are not trusted.
        envelope.timestamp = now_ms();

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push(envelope.clone());
        }

        // Snapshot the subscriber sets before invoking anything, so a
        // handler un-registering another handler cannot corrupt iteration.
        let (global, typed) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry.snapshot(&envelope.kind)
        };
        for handler in &global {
            handler(&envelope.data);
        }
        for handler in &typed {
            handler(&envelope.data);
        }
    }
}

// ── Task control flow ───────────────────────────────────────────────────────

/// What the task does next when no transport is open.
enum Next {
    /// Wait for commands.
    Idle,
    /// Start a connect cycle immediately.
    ConnectNow,
    /// Start a connect cycle once the backoff delay elapses.
    ReconnectAt(TokioInstant),
    /// Stop the task.
    Shutdown,
}

/// How a connect cycle ended.
enum CycleOutcome {
    Opened(Box<dyn TransportLink>),
    Failed(RelayLinkError),
    /// Aborted by an explicit disconnect.
    Aborted,
    Shutdown,
}

/// The main background task. Owns the transport handle for its entire
/// lifetime; no other component writes to it.
pub(crate) async fn connection_task(mut cmd_rx: mpsc::Receiver<ConnCmd>, ctx: TaskContext) {
    let mut backoff = BackoffPolicy::new(
        ctx.options.reconnect_base_interval(),
        ctx.options.max_reconnect_attempts,
    );

    let mut next = if ctx.options.auto_connect {
        Next::ConnectNow
    } else {
        Next::Idle
    };

    loop {
        next = match next {
            Next::ConnectNow => match connect_cycle(&mut cmd_rx, &ctx).await {
                CycleOutcome::Opened(mut link) => {
                    backoff.reset();
                    ctx.set_status(ConnectionState::Connected, None, 100);
                    log::info!("[relay-link] Connected to {}", ctx.url);
                    ctx.handlers.emit_connect();
                    replay_queue(link.as_mut(), &ctx).await;
                    ctx.gate.resolve();
                    connected_loop(link, &mut cmd_rx, &ctx, &mut backoff).await
                }
                CycleOutcome::Failed(error) => {
                    log::warn!("[relay-link] Connection attempt failed: {}", error);
                    ctx.gate.reject(error.clone());
                    ctx.handlers.emit_error(error.clone());
                    let wait_state = match &error {
                        RelayLinkError::ConnectTimeout(_) => ConnectionState::TimedOut,
                        _ => ConnectionState::Errored,
                    };
                    schedule_reconnect(&ctx, &mut backoff, error, wait_state)
                }
                CycleOutcome::Aborted => Next::Idle,
                CycleOutcome::Shutdown => Next::Shutdown,
            },
            Next::ReconnectAt(deadline) => {
                await_reconnect(deadline, &mut cmd_rx, &ctx, &mut backoff).await
            }
            Next::Idle => idle(&mut cmd_rx, &ctx, &mut backoff).await,
            Next::Shutdown => {
                log::debug!("[relay-link] Connection task stopped");
                return;
            }
        };
    }
}

/// One connection attempt: open the transport with a bounded timeout while
/// ticking the progress indicator and servicing commands.
async fn connect_cycle(cmd_rx: &mut mpsc::Receiver<ConnCmd>, ctx: &TaskContext) -> CycleOutcome {
    ctx.gate.arm();
    ctx.set_status(ConnectionState::Connecting, None, 0);
    log::debug!("[relay-link] Connecting to {}", ctx.url);

    let connect_timeout = ctx.options.connect_timeout();
    let connect_fut = tokio::time::timeout(
        connect_timeout,
        ctx.connector.connect(&ctx.url, &ctx.options.subprotocols),
    );
    tokio::pin!(connect_fut);

    // Progress climbs toward 90 while the attempt is in flight; the last
    // step to 100 lands on open.
    let tick = (connect_timeout / 10).max(Duration::from_millis(10));
    let mut progress_deadline = TokioInstant::now() + tick;
    let mut progress: u8 = 0;

    loop {
        let progress_sleep = tokio::time::sleep_until(progress_deadline);
        tokio::pin!(progress_sleep);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Connect { ack }) => {
                    // Already connecting: the caller joins the in-flight
                    // cycle instead of opening a second transport.
                    let _ = ack.send(());
                }
                Some(ConnCmd::Disconnect { ack }) => {
                    ctx.gate.reject(RelayLinkError::Transport(
                        "connection attempt aborted by disconnect".to_string(),
                    ));
                    ctx.set_status(ConnectionState::Disconnected, None, 0);
                    let _ = ack.send(());
                    return CycleOutcome::Aborted;
                }
                Some(ConnCmd::Transmit { queue_fallback, result_tx, .. }) => {
                    let _ = result_tx.send(ctx.queue_or_fail(queue_fallback));
                }
                Some(ConnCmd::Shutdown) | None => {
                    ctx.gate.reject(RelayLinkError::ChannelClosed(
                        "client shut down".to_string(),
                    ));
                    ctx.set_status(ConnectionState::Disconnected, None, 0);
                    return CycleOutcome::Shutdown;
                }
            },

            _ = &mut progress_sleep => {
                progress = (progress + 10).min(90);
                ctx.tick_progress(progress);
                progress_deadline = TokioInstant::now() + tick;
            }

            result = &mut connect_fut => {
                return match result {
                    Ok(Ok(link)) => CycleOutcome::Opened(link),
                    Ok(Err(error)) => CycleOutcome::Failed(error),
                    Err(_) => CycleOutcome::Failed(RelayLinkError::ConnectTimeout(format!(
                        "no connection after {:?}",
                        connect_timeout
                    ))),
                };
            }
        }
    }
}

/// Replay queued messages after a (re)connect. Runs once, inside the task,
/// before any fresh command is serviced, so queued-then-fresh send ordering
/// is preserved. Entries that fail with replay budget left are re-enqueued
/// with their retry count incremented; the rest are dropped.
async fn replay_queue(link: &mut dyn TransportLink, ctx: &TaskContext) {
    let drained = {
        let mut queue = ctx.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain()
    };
    if drained.is_empty() {
        return;
    }
    log::info!("[relay-link] Replaying {} queued message(s)", drained.len());

    for mut message in drained {
        let text = match serde_json::to_string(&message.envelope) {
            Ok(text) => text,
            Err(e) => {
                log::warn!(
                    "[relay-link] Dropping unserializable queued '{}' message: {}",
                    message.envelope.kind,
                    e
                );
                continue;
            }
        };
        match link.send(&text).await {
            Ok(()) => ctx.frame_sent(&text),
            Err(e) => {
                log::debug!(
                    "[relay-link] Replay of '{}' failed: {}",
                    message.envelope.kind,
                    e
                );
                if message.retries < MAX_ENTRY_RETRIES {
                    message.retries += 1;
                    ctx.enqueue(message);
                } else {
                    log::debug!(
                        "[relay-link] Dropping '{}' message after {} failed replays",
                        message.envelope.kind,
                        message.retries
                    );
                }
            }
        }
    }
}

/// The Connected phase: multiplex commands, inbound events and the
/// heartbeat. The heartbeat timer lives in this select arm, so leaving the
/// phase stops it synchronously with no orphaned timers.
async fn connected_loop(
    mut link: Box<dyn TransportLink>,
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    ctx: &TaskContext,
    backoff: &mut BackoffPolicy,
) -> Next {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

    let heartbeat = ctx.options.heartbeat_interval();
    let has_heartbeat = !heartbeat.is_zero();
    let mut heartbeat_deadline =
        TokioInstant::now() + if has_heartbeat { heartbeat } else { FAR_FUTURE };

    loop {
        let heartbeat_sleep = tokio::time::sleep_until(heartbeat_deadline);
        tokio::pin!(heartbeat_sleep);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Connect { ack }) => {
                    // Already connected: immediately satisfied.
                    let _ = ack.send(());
                }
                Some(ConnCmd::Disconnect { ack }) => {
                    link.close().await;
                    ctx.gate.reset();
                    backoff.reset();
                    ctx.set_status(ConnectionState::Disconnected, None, 0);
                    ctx.handlers.emit_disconnect(DisconnectReason::clean(
                        "client disconnected",
                        None,
                    ));
                    log::info!("[relay-link] Disconnected");
                    let _ = ack.send(());
                    return Next::Idle;
                }
                Some(ConnCmd::Transmit { text, queue_fallback, result_tx }) => {
                    match link.send(&text).await {
                        Ok(()) => {
                            ctx.frame_sent(&text);
                            let _ = result_tx.send(SendOutcome::Sent);
                        }
                        Err(error) => {
                            // A write failure counts as "not connected" for
                            // queuing purposes, and the link is torn down.
                            let _ = result_tx.send(ctx.queue_or_fail(queue_fallback));
                            ctx.handlers.emit_error(error.clone());
                            return after_unclean(ctx, backoff, error);
                        }
                    }
                }
                Some(ConnCmd::Shutdown) | None => {
                    link.close().await;
                    ctx.gate.reset();
                    ctx.set_status(ConnectionState::Disconnected, None, 0);
                    return Next::Shutdown;
                }
            },

            _ = &mut heartbeat_sleep, if has_heartbeat => {
                // Liveness probe through the normal send path, queuing and
                // waiting disabled: a probe is worthless once queued. A
                // dead connection surfaces as a close/error event, not
                // through the probe itself.
                let probe = Envelope::new("ping", serde_json::json!({ "timestamp": now_ms() }));
                match serde_json::to_string(&probe) {
                    Ok(text) => {
                        if let Err(error) = link.send(&text).await {
                            log::warn!("[relay-link] Heartbeat send failed: {}", error);
                            ctx.handlers.emit_error(error.clone());
                            return after_unclean(ctx, backoff, error);
                        }
                        ctx.frame_sent(&text);
                    }
                    Err(e) => log::warn!("[relay-link] Failed to serialize heartbeat: {}", e),
                }
                heartbeat_deadline = TokioInstant::now() + heartbeat;
            }

            event = link.next_event() => match event {
                Some(TransportEvent::Frame(text)) => {
                    ctx.dispatch_frame(&text);
                }
                Some(TransportEvent::Closed { code, reason, was_clean }) => {
                    let message = if reason.is_empty() {
                        "connection closed".to_string()
                    } else {
                        reason
                    };
                    if was_clean {
                        ctx.gate.reset();
                        ctx.set_status(ConnectionState::Disconnected, None, 0);
                        ctx.handlers.emit_disconnect(DisconnectReason::clean(message, code));
                        log::info!("[relay-link] Connection closed cleanly");
                        return Next::Idle;
                    }
                    ctx.handlers.emit_disconnect(DisconnectReason::unclean(message.clone(), code));
                    return after_unclean(ctx, backoff, RelayLinkError::UncleanClose {
                        code,
                        reason: message,
                    });
                }
                Some(TransportEvent::Error(message)) => {
                    let error = RelayLinkError::Transport(message);
                    ctx.handlers.emit_error(error.clone());
                    ctx.handlers.emit_disconnect(DisconnectReason::unclean(error.to_string(), None));
                    return after_unclean(ctx, backoff, error);
                }
                None => {
                    let error = RelayLinkError::UncleanClose {
                        code: None,
                        reason: "transport stream ended".to_string(),
                    };
                    ctx.handlers.emit_disconnect(DisconnectReason::unclean(
                        "transport stream ended",
                        None,
                    ));
                    return after_unclean(ctx, backoff, error);
                }
            }
        }
    }
}

/// Leave Connected over an unclean close and invoke reconnect scheduling.
fn after_unclean(ctx: &TaskContext, backoff: &mut BackoffPolicy, error: RelayLinkError) -> Next {
    ctx.gate.reset();
    log::warn!("[relay-link] {}", error);
    schedule_reconnect(ctx, backoff, error, ConnectionState::Disconnected)
}

/// Consume one reconnect attempt. Either schedules the next attempt after
/// the backoff delay or, with the budget exhausted, parks the task with a
/// terminal `MaxAttemptsExceeded` until an explicit connect/retry.
fn schedule_reconnect(
    ctx: &TaskContext,
    backoff: &mut BackoffPolicy,
    error: RelayLinkError,
    wait_state: ConnectionState,
) -> Next {
    match backoff.next_attempt() {
        Some(delay) => {
            ctx.set_status(wait_state, Some(error), 0);
            log::info!(
                "[relay-link] Reconnecting in {:?} (attempt {}/{})",
                delay,
                backoff.attempts(),
                backoff.max_attempts()
            );
            Next::ReconnectAt(TokioInstant::now() + delay)
        }
        None => {
            let terminal = RelayLinkError::MaxAttemptsExceeded(backoff.max_attempts());
            log::warn!("[relay-link] Giving up: {}", terminal);
            ctx.handlers.emit_error(terminal.clone());
            ctx.set_status(ConnectionState::Errored, Some(terminal), 0);
            Next::Idle
        }
    }
}

/// Wait out the backoff delay, still servicing commands. An explicit
/// connect skips the remaining delay and resets the attempt budget.
async fn await_reconnect(
    deadline: TokioInstant,
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    ctx: &TaskContext,
    backoff: &mut BackoffPolicy,
) -> Next {
    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Connect { ack }) => {
                    backoff.reset();
                    ctx.gate.arm();
                    let _ = ack.send(());
                    return Next::ConnectNow;
                }
                Some(ConnCmd::Disconnect { ack }) => {
                    backoff.reset();
                    ctx.set_status(ConnectionState::Disconnected, None, 0);
                    let _ = ack.send(());
                    return Next::Idle;
                }
                Some(ConnCmd::Transmit { queue_fallback, result_tx, .. }) => {
                    let _ = result_tx.send(ctx.queue_or_fail(queue_fallback));
                }
                Some(ConnCmd::Shutdown) | None => return Next::Shutdown,
            },

            _ = tokio::time::sleep_until(deadline) => return Next::ConnectNow,
        }
    }
}

/// No transport, no scheduled attempt: wait for commands.
async fn idle(
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    ctx: &TaskContext,
    backoff: &mut BackoffPolicy,
) -> Next {
    loop {
        match cmd_rx.recv().await {
            Some(ConnCmd::Connect { ack }) => {
                backoff.reset();
                ctx.gate.arm();
                let _ = ack.send(());
                return Next::ConnectNow;
            }
            Some(ConnCmd::Disconnect { ack }) => {
                backoff.reset();
                ctx.set_status(ConnectionState::Disconnected, None, 0);
                let _ = ack.send(());
            }
            Some(ConnCmd::Transmit { queue_fallback, result_tx, .. }) => {
                let _ = result_tx.send(ctx.queue_or_fail(queue_fallback));
            }
            Some(ConnCmd::Shutdown) | None => return Next::Shutdown,
        }
    }
}
