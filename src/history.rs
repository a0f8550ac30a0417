//! Bounded ring of recently received envelopes.

use std::collections::VecDeque;

use crate::models::Envelope;

/// Number of received envelopes retained for inspection.
pub(crate) const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Keeps the most recent inbound envelopes plus the very last one, for
/// debugging and late subscribers that want to inspect recent traffic.
#[derive(Debug)]
pub(crate) struct MessageHistory {
    entries: VecDeque<Envelope>,
    last: Option<Envelope>,
    capacity: usize,
}

impl MessageHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            last: None,
            capacity,
        }
    }

    pub(crate) fn push(&mut self, envelope: Envelope) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.last = Some(envelope.clone());
        self.entries.push_back(envelope);
    }

    pub(crate) fn last(&self) -> Option<Envelope> {
        self.last.clone()
    }

    pub(crate) fn snapshot(&self) -> Vec<Envelope> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(kind: &str) -> Envelope {
        Envelope::new(kind, serde_json::json!({}))
    }

    #[test]
    fn retains_most_recent_entries() {
        let mut history = MessageHistory::new(3);
        for kind in ["a", "b", "c", "d"] {
            history.push(env(kind));
        }
        let kinds: Vec<_> = history.snapshot().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["b", "c", "d"]);
        assert_eq!(history.last().map(|e| e.kind).as_deref(), Some("d"));
    }

    #[test]
    fn clear_resets_last_message_too() {
        let mut history = MessageHistory::new(3);
        history.push(env("a"));
        history.clear();
        assert!(history.snapshot().is_empty());
        assert!(history.last().is_none());
    }
}
