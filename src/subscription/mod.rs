//! Log subscriptions and the registry tracking their lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Result;

use crate::common::{BlockRef, EventLog};

pub mod state_subscriber;
pub use state_subscriber::{StateHandler, StateSubscriber};

/// An address to watch, together with the event topics of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAndTopics {
    /// The emitting contract address; one subscriber is kept per address.
    pub address: Address,
    /// Topics the subscriber cares about. Logs are always fetched per
    /// address; when this list is non-empty only logs whose first topic is
    /// in it are dispatched to the subscriber.
    pub topics: Vec<B256>,
}

impl AddressAndTopics {
    /// Subscription for every log emitted by `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            topics: Vec::new(),
        }
    }
}

/// ## LogSubscriber
///
/// A consumer of event logs for a single address. The engine guarantees that
/// `initialize` happens before any `handle_log`, that logs arrive serially in
/// ascending `(block_number, log_index)` order, and that after a
/// `rollback(block)` every later log has a block number above `block`.
///
/// Callbacks run inside the engine's block handling pass and must not call
/// back into the engine.
#[async_trait]
pub trait LogSubscriber: Send + Sync + 'static {
    /// Called when the engine anchors (or re-anchors) the subscriber at
    /// `anchor`. Returning an error reschedules the subscriber for a later
    /// initialization attempt.
    async fn initialize(&self, anchor: BlockRef) -> Result<()>;

    /// Delivers one log. Failures are the subscriber's responsibility; the
    /// engine keeps going regardless.
    async fn handle_log(&self, log: &EventLog);

    /// Informs the subscriber that the chain was rolled back to `block`.
    /// Every log previously delivered above `block` must be considered
    /// discarded. Must not block on I/O.
    fn rollback(&self, block: BlockRef);
}

/// A registered subscription and its lifecycle marks.
pub(crate) struct Subscription {
    pub(crate) topics: Vec<B256>,
    pub(crate) subscriber: Arc<dyn LogSubscriber>,
    /// The block the subscriber was initialized at; unset while an
    /// initialization attempt is pending.
    pub(crate) initialized_at: Option<BlockRef>,
    /// The block of the last event the subscriber saw.
    pub(crate) last_seen: Option<BlockRef>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topics", &self.topics)
            .field("initialized_at", &self.initialized_at)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

/// Maps subscribed addresses to their subscribers and tracks which of them
/// still await initialization.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: HashMap<Address, Subscription>,
    waiting: HashSet<Address>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and marks it waiting for initialization.
    /// A second subscription for the same address replaces the first.
    pub(crate) fn insert(&mut self, sub: AddressAndTopics, subscriber: Arc<dyn LogSubscriber>) {
        self.subscriptions.insert(
            sub.address,
            Subscription {
                topics: sub.topics,
                subscriber,
                initialized_at: None,
                last_seen: None,
            },
        );
        self.waiting.insert(sub.address);
    }

    /// The full subscribed address set, as handed to `get_logs`.
    pub(crate) fn addresses(&self) -> Vec<Address> {
        self.subscriptions.keys().copied().collect()
    }

    pub(crate) fn subscriber(&self, address: &Address) -> Option<Arc<dyn LogSubscriber>> {
        self.subscriptions
            .get(address)
            .map(|sub| Arc::clone(&sub.subscriber))
    }

    /// Whether the subscription at the log's address cares about the log's
    /// leading topic. An empty topic list subscribes to everything.
    pub(crate) fn wants(&self, log: &EventLog) -> bool {
        let Some(sub) = self.subscriptions.get(&log.address) else {
            return false;
        };
        if sub.topics.is_empty() {
            return true;
        }
        log.topics
            .first()
            .map(|topic| sub.topics.contains(topic))
            .unwrap_or(false)
    }

    pub(crate) fn is_initialized(&self, address: &Address) -> bool {
        self.subscriptions
            .get(address)
            .map(|sub| sub.initialized_at.is_some())
            .unwrap_or(false)
    }

    /// Drains the waiting-init set. Sorted so the initialization order is
    /// deterministic.
    pub(crate) fn take_waiting(&mut self) -> Vec<Address> {
        let mut waiting: Vec<Address> = self.waiting.drain().collect();
        waiting.sort();
        waiting
    }

    /// Puts an address back on the initialization worklist.
    pub(crate) fn requeue(&mut self, address: Address) {
        if self.subscriptions.contains_key(&address) {
            self.waiting.insert(address);
        }
    }

    pub(crate) fn mark_initialized(&mut self, address: Address, block: BlockRef) {
        if let Some(sub) = self.subscriptions.get_mut(&address) {
            sub.initialized_at = Some(block);
            sub.last_seen = Some(block);
        }
    }

    pub(crate) fn mark_seen(&mut self, address: Address, block: BlockRef) {
        if let Some(sub) = self.subscriptions.get_mut(&address) {
            sub.last_seen = Some(block);
        }
    }

    pub(crate) fn entries_mut(
        &mut self,
    ) -> impl Iterator<Item = (&Address, &mut Subscription)> {
        self.subscriptions.iter_mut()
    }

    /// Marks every subscription as waiting for a fresh initialization.
    pub(crate) fn reset_all(&mut self) {
        for (address, sub) in self.subscriptions.iter_mut() {
            sub.initialized_at = None;
            sub.last_seen = None;
            self.waiting.insert(*address);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl LogSubscriber for Noop {
        async fn initialize(&self, _anchor: BlockRef) -> Result<()> {
            Ok(())
        }

        async fn handle_log(&self, _log: &EventLog) {}

        fn rollback(&self, _block: BlockRef) {}
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_insert_replaces_prior_subscription() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(AddressAndTopics::new(addr(1)), Arc::new(Noop));
        registry.mark_initialized(addr(1), BlockRef::default());

        registry.insert(AddressAndTopics::new(addr(1)), Arc::new(Noop));

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_initialized(&addr(1)));
        assert_eq!(registry.take_waiting(), vec![addr(1)]);
    }

    #[test]
    fn test_requeue_ignores_unknown_addresses() {
        let mut registry = SubscriptionRegistry::new();
        registry.requeue(addr(7));
        assert!(registry.take_waiting().is_empty());
    }

    #[test]
    fn test_reset_all_marks_everything_waiting() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(AddressAndTopics::new(addr(1)), Arc::new(Noop));
        registry.insert(AddressAndTopics::new(addr(2)), Arc::new(Noop));
        let block = BlockRef {
            number: 10,
            hash: alloy_primitives::B256::repeat_byte(1),
        };
        for address in registry.take_waiting() {
            registry.mark_initialized(address, block);
        }

        registry.reset_all();

        assert_eq!(registry.take_waiting().len(), 2);
        assert!(!registry.is_initialized(&addr(1)));
    }
}
