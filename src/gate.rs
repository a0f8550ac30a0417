//! Readiness gate: a re-armable single-shot signal for "the transport is
//! open and usable".
//!
//! The gate is armed at the start of every connect cycle, resolved exactly
//! once when the transport opens, and rejected exactly once when the cycle
//! fails (timeout, transport error, explicit disconnect). Waiters observe a
//! genuine notification rather than polling, and a waiter present while the
//! cycle is abandoned observes rejection, never an unresolved hang.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RelayLinkError, Result};

#[derive(Debug, Clone)]
enum GateState {
    /// No connect cycle in progress and no settled outcome to report.
    Idle,
    /// A connect cycle is in flight.
    Pending,
    /// The current cycle's transport opened.
    Open,
    /// The current cycle failed.
    Failed(RelayLinkError),
}

#[derive(Debug, Clone)]
struct GateValue {
    cycle: u64,
    state: GateState,
}

/// Shared handle to the gate. Cloned between the client surface (waiters)
/// and the connection task (the only settler).
#[derive(Clone)]
pub(crate) struct ReadinessGate {
    tx: Arc<watch::Sender<GateValue>>,
}

impl ReadinessGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(GateValue {
            cycle: 0,
            state: GateState::Idle,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Begin a new connect cycle. Joining an already-pending cycle is a
    /// no-op, so concurrent connect requests share one cycle.
    pub(crate) fn arm(&self) {
        self.tx.send_if_modified(|value| {
            if matches!(value.state, GateState::Pending) {
                return false;
            }
            value.cycle += 1;
            value.state = GateState::Pending;
            true
        });
    }

    /// Settle the current cycle as open. No-op unless pending.
    pub(crate) fn resolve(&self) {
        self.tx.send_if_modified(|value| {
            if matches!(value.state, GateState::Pending) {
                value.state = GateState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Settle the current cycle as failed. No-op unless pending.
    pub(crate) fn reject(&self, error: RelayLinkError) {
        self.tx.send_if_modified(|value| {
            if matches!(value.state, GateState::Pending) {
                value.state = GateState::Failed(error);
                true
            } else {
                false
            }
        });
    }

    /// Drop a settled Open back to Idle. Invoked when leaving Connected so
    /// later waiters do not observe a stale open signal.
    pub(crate) fn reset(&self) {
        self.tx.send_modify(|value| {
            value.state = GateState::Idle;
        });
    }

    /// Wait until the transport is open, bounded by `timeout`.
    ///
    /// An already-open gate resolves immediately. A stale failure from an
    /// earlier cycle does not reject the wait; only a settle that happens
    /// after the wait begins does. With no settle before the deadline the
    /// wait fails exactly at `timeout`, leaving no dangling timer.
    pub(crate) async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        if matches!(rx.borrow_and_update().state, GateState::Open) {
            return Ok(());
        }
        match tokio::time::timeout(timeout, Self::next_settle(&mut rx)).await {
            Ok(result) => result,
            Err(_) => Err(RelayLinkError::ConnectTimeout(format!(
                "gave up waiting for connection after {:?}",
                timeout
            ))),
        }
    }

    /// Wait for the in-flight cycle to settle, without an external timeout.
    ///
    /// Used by `connect()`, whose cycle is already bounded by the connect
    /// timeout inside the connection task. Unlike [`wait`](Self::wait), a
    /// currently-settled failure is reported immediately: the caller just
    /// observed the gate pending (or asked for the cycle it started), so a
    /// failure sitting in the gate is that cycle's outcome, not stale.
    pub(crate) async fn settled(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        {
            let value = rx.borrow_and_update();
            match &value.state {
                GateState::Open => return Ok(()),
                GateState::Failed(error) => return Err(error.clone()),
                GateState::Idle => {
                    return Err(RelayLinkError::Transport(
                        "connection closed before becoming ready".to_string(),
                    ))
                }
                GateState::Pending => {}
            }
        }
        Self::next_settle(&mut rx).await
    }

    async fn next_settle(rx: &mut watch::Receiver<GateValue>) -> Result<()> {
        loop {
            if rx.changed().await.is_err() {
                return Err(RelayLinkError::ChannelClosed(
                    "connection task stopped".to_string(),
                ));
            }
            let state = rx.borrow_and_update().state.clone();
            match state {
                GateState::Open => return Ok(()),
                GateState::Failed(error) => return Err(error),
                // A new cycle armed (or reset) before we woke; keep waiting
                // for its outcome.
                GateState::Pending | GateState::Idle => continue,
            }
        }
    }
}
