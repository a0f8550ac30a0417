//! Bounded FIFO queue for outbound messages that could not be sent.
//!
//! Insertion beyond capacity evicts the oldest entry rather than rejecting
//! the new one. The queue is memory-resident and best-effort: entries whose
//! replay fails more than [`MAX_ENTRY_RETRIES`] times are dropped.

use std::collections::VecDeque;

use crate::models::QueuedMessage;

/// Fixed capacity of the outbound message queue.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Replay attempts allowed per queued entry before it is dropped. The count
/// persists across reconnect cycles.
pub(crate) const MAX_ENTRY_RETRIES: u32 = 3;

/// FIFO buffer of messages awaiting replay, shared between the public API
/// and the connection task. Contents survive reconnects.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry. At capacity the oldest entry is evicted first; the
    /// queue never rejects an insertion.
    pub(crate) fn enqueue(&mut self, message: QueuedMessage) {
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                log::debug!(
                    "[relay-link] Queue full ({}), evicting oldest '{}' message",
                    self.capacity,
                    evicted.envelope.kind
                );
            }
        }
        self.entries.push_back(message);
    }

    /// Take a point-in-time copy of the queue and clear it. Replay works on
    /// the copy; failed entries are re-enqueued by the caller.
    pub(crate) fn drain(&mut self) -> Vec<QueuedMessage> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
