//! Registry of inbound message subscribers.
//!
//! Subscribers are either scoped to a message type tag or global (invoked
//! for every message). Each subscription is identified by an explicit
//! [`HandlerId`] token, so unsubscription is well-defined and cannot
//! silently fail to remove a handler. The registry holds non-owning
//! references to handlers; they are released only via the
//! [`Subscription`] capability or [`clear`](HandlerRegistry::clear).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// Callback invoked with the `data` payload of a matching envelope.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identity token for a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Where a subscription lives in the registry.
#[derive(Debug, Clone)]
pub(crate) enum SubscriptionKey {
    Typed { kind: String, id: HandlerId },
    Global { id: HandlerId },
}

/// Mapping from message-type tag to subscriber callbacks, plus the set of
/// global subscribers. Dispatch order within each set is insertion order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    typed: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
    global: Vec<(HandlerId, MessageHandler)>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub(crate) fn subscribe(&mut self, kind: &str, handler: MessageHandler) -> HandlerId {
        let id = self.allocate_id();
        self.typed
            .entry(kind.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn subscribe_all(&mut self, handler: MessageHandler) -> HandlerId {
        let id = self.allocate_id();
        self.global.push((id, handler));
        id
    }

    /// Remove a subscription. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, key: &SubscriptionKey) -> bool {
        match key {
            SubscriptionKey::Typed { kind, id } => {
                let Some(entries) = self.typed.get_mut(kind) else {
                    return false;
                };
                let before = entries.len();
                entries.retain(|(entry_id, _)| entry_id != id);
                let removed = entries.len() != before;
                if entries.is_empty() {
                    self.typed.remove(kind);
                }
                removed
            }
            SubscriptionKey::Global { id } => {
                let before = self.global.len();
                self.global.retain(|(entry_id, _)| entry_id != id);
                self.global.len() != before
            }
        }
    }

    /// Remove all subscriptions atomically.
    pub(crate) fn clear(&mut self) {
        self.typed.clear();
        self.global.clear();
    }

    /// Snapshot the subscriber sets for a message type: global handlers
    /// first, then type-scoped, each in insertion order. Dispatch runs on
    /// the snapshot, so a handler un-registering another handler from
    /// inside its callback cannot corrupt iteration.
    pub(crate) fn snapshot(&self, kind: &str) -> (Vec<MessageHandler>, Vec<MessageHandler>) {
        let global = self.global.iter().map(|(_, h)| h.clone()).collect();
        let typed = self
            .typed
            .get(kind)
            .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        (global, typed)
    }

    #[cfg(test)]
    fn typed_count(&self, kind: &str) -> usize {
        self.typed.get(kind).map(Vec::len).unwrap_or(0)
    }
}

/// Capability returned from a subscribe call. Calling
/// [`unsubscribe`](Subscription::unsubscribe) releases the handler; dropping
/// the capability without calling it leaves the handler registered (the
/// caller owns the handler's lifetime).
pub struct Subscription {
    registry: Arc<RwLock<HandlerRegistry>>,
    key: SubscriptionKey,
}

impl Subscription {
    pub(crate) fn new(registry: Arc<RwLock<HandlerRegistry>>, key: SubscriptionKey) -> Self {
        Self { registry, key }
    }

    /// The identity token of the underlying handler.
    pub fn id(&self) -> HandlerId {
        match self.key {
            SubscriptionKey::Typed { id, .. } | SubscriptionKey::Global { id } => id,
        }
    }

    /// Remove the handler from the registry.
    pub fn unsubscribe(self) {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registry.remove(&self.key);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn typed_and_global_are_independent() {
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.subscribe("utxo", counting_handler(calls.clone()));
        registry.subscribe_all(counting_handler(calls.clone()));

        let (global, typed) = registry.snapshot("utxo");
        assert_eq!(global.len(), 1);
        assert_eq!(typed.len(), 1);

        // Unrelated type still reaches the global set.
        let (global, typed) = registry.snapshot("tx");
        assert_eq!(global.len(), 1);
        assert!(typed.is_empty());
    }

    #[test]
    fn multiple_subscriptions_per_type_dispatch_in_insertion_order() {
        let mut registry = HandlerRegistry::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.subscribe(
                "utxo",
                Arc::new(move |_| {
                    order.write().unwrap().push(tag);
                }),
            );
        }

        let (_, typed) = registry.snapshot("utxo");
        for handler in &typed {
            handler(&Value::Null);
        }
        assert_eq!(*order.read().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn remove_targets_exactly_one_handler() {
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let keep = registry.subscribe("utxo", counting_handler(calls.clone()));
        let drop_id = registry.subscribe("utxo", counting_handler(calls.clone()));

        assert!(registry.remove(&SubscriptionKey::Typed {
            kind: "utxo".into(),
            id: drop_id,
        }));
        assert_eq!(registry.typed_count("utxo"), 1);

        // Removing again reports nothing removed.
        assert!(!registry.remove(&SubscriptionKey::Typed {
            kind: "utxo".into(),
            id: drop_id,
        }));

        let (_, typed) = registry.snapshot("utxo");
        assert_eq!(typed.len(), 1);
        let _ = keep;
    }

    #[test]
    fn clear_removes_everything() {
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.subscribe("a", counting_handler(calls.clone()));
        registry.subscribe("b", counting_handler(calls.clone()));
        registry.subscribe_all(counting_handler(calls));
        registry.clear();

        let (global, typed) = registry.snapshot("a");
        assert!(global.is_empty());
        assert!(typed.is_empty());
    }

    #[test]
    fn subscription_capability_unsubscribes() {
        let registry = Arc::new(RwLock::new(HandlerRegistry::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let id = registry
            .write()
            .unwrap()
            .subscribe("utxo", counting_handler(calls));
        let sub = Subscription::new(
            registry.clone(),
            SubscriptionKey::Typed {
                kind: "utxo".into(),
                id,
            },
        );
        sub.unsubscribe();
        assert_eq!(registry.read().unwrap().typed_count("utxo"), 0);
    }
}
