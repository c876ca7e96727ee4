//! Convenience base for subscribers that derive a per-block state snapshot.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::Result;

use crate::common::{BlockRef, EventLog};

use super::LogSubscriber;

/// ## StateHandler
///
/// The user-supplied half of a [StateSubscriber]: builds the initial state at
/// the anchor block and folds incoming logs into it. The snapshot type must
/// be [Clone]; a clone of the previous block's snapshot seeds each new block.
#[async_trait]
pub trait StateHandler: Send + Sync + 'static {
    /// The per-block snapshot type.
    type State: Clone + Send + 'static;

    /// Builds the state as of the anchor block.
    async fn state_initialize(&self, anchor: BlockRef) -> Result<Self::State>;

    /// Folds one log into the state for the log's block.
    fn state_handle_log(&self, state: Self::State, log: &EventLog) -> Self::State;
}

#[derive(Debug)]
struct Snapshots<S> {
    by_block: BTreeMap<u64, S>,
    last_seen: Option<BlockRef>,
}

/// [LogSubscriber] keeping one state snapshot per block.
///
/// The first log of a new block installs a copy of the snapshot at the last
/// seen block before the log is folded in, so every cached block keeps the
/// exact state as of its own height. A rollback simply deletes the snapshots
/// above the rollback target. All snapshot access goes through a
/// per-subscriber mutex.
pub struct StateSubscriber<H: StateHandler> {
    handler: H,
    inner: Mutex<Snapshots<H::State>>,
}

impl<H: StateHandler> StateSubscriber<H> {
    /// Creates a subscriber around the given handler. No state exists until
    /// the engine initializes the subscriber.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            inner: Mutex::new(Snapshots {
                by_block: BTreeMap::new(),
                last_seen: None,
            }),
        }
    }

    /// The snapshot as of the most recently seen block, if initialized.
    ///
    /// After a rollback the target block itself may never have carried an
    /// event; the nearest snapshot at or below the last seen block is the
    /// state as of that block.
    pub fn current_state(&self) -> Option<H::State> {
        let inner = self.inner.lock().expect("snapshot mutex poisoned");
        let last_seen = inner.last_seen?;
        inner
            .by_block
            .range(..=last_seen.number)
            .next_back()
            .map(|(_, state)| state.clone())
    }

    /// The snapshot at the given block number, if still cached.
    pub fn state_at(&self, number: u64) -> Option<H::State> {
        let inner = self.inner.lock().expect("snapshot mutex poisoned");
        inner.by_block.get(&number).cloned()
    }

    /// The block of the last event folded into the state.
    pub fn last_seen(&self) -> Option<BlockRef> {
        self.inner.lock().expect("snapshot mutex poisoned").last_seen
    }

    /// The wrapped handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: StateHandler> std::fmt::Debug for StateSubscriber<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSubscriber")
            .field("last_seen", &self.last_seen())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<H: StateHandler> LogSubscriber for StateSubscriber<H> {
    async fn initialize(&self, anchor: BlockRef) -> Result<()> {
        let state = self.handler.state_initialize(anchor).await?;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| eyre::eyre!("snapshot mutex poisoned"))?;
        inner.by_block.clear();
        inner.by_block.insert(anchor.number, state);
        inner.last_seen = Some(anchor);

        Ok(())
    }

    async fn handle_log(&self, log: &EventLog) {
        let mut inner = self.inner.lock().expect("snapshot mutex poisoned");

        let Some(last_seen) = inner.last_seen else {
            // never initialized; nothing to fold the log into
            return;
        };

        if !inner.by_block.contains_key(&log.block_number) {
            // Seed the new block from the newest snapshot not above the last
            // seen block; the exact block may have carried no event.
            let seed = inner
                .by_block
                .range(..=last_seen.number)
                .next_back()
                .map(|(_, state)| state.clone());
            let Some(snapshot) = seed else {
                tracing::warn!(
                    block = log.block_number,
                    "no snapshot at or below the last seen block, dropping log"
                );
                return;
            };
            inner.by_block.insert(log.block_number, snapshot);
        }

        let state = inner
            .by_block
            .remove(&log.block_number)
            .expect("snapshot installed above");
        let state = self.handler.state_handle_log(state, log);
        inner.by_block.insert(log.block_number, state);

        inner.last_seen = Some(BlockRef {
            number: log.block_number,
            hash: log.block_hash,
        });
    }

    fn rollback(&self, block: BlockRef) {
        let mut inner = self.inner.lock().expect("snapshot mutex poisoned");

        if inner.last_seen.is_none() {
            return;
        }

        inner.by_block.split_off(&(block.number + 1));
        inner.last_seen = Some(block);
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, B256};

    use super::*;

    struct Counter;

    #[async_trait]
    impl StateHandler for Counter {
        type State = u64;

        async fn state_initialize(&self, _anchor: BlockRef) -> Result<u64> {
            Ok(0)
        }

        fn state_handle_log(&self, state: u64, _log: &EventLog) -> u64 {
            state + 1
        }
    }

    fn log_at(block_number: u64) -> EventLog {
        EventLog {
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            address: Address::repeat_byte(1),
            ..Default::default()
        }
    }

    fn anchor(number: u64) -> BlockRef {
        BlockRef {
            number,
            hash: B256::repeat_byte(number as u8),
        }
    }

    #[tokio::test]
    async fn test_copies_snapshot_on_new_block() {
        let sub = StateSubscriber::new(Counter);
        sub.initialize(anchor(100)).await.unwrap();

        sub.handle_log(&log_at(101)).await;
        sub.handle_log(&log_at(101)).await;
        sub.handle_log(&log_at(102)).await;

        assert_eq!(sub.state_at(100), Some(0));
        assert_eq!(sub.state_at(101), Some(2));
        assert_eq!(sub.state_at(102), Some(3));
        assert_eq!(sub.current_state(), Some(3));
    }

    #[tokio::test]
    async fn test_rollback_deletes_newer_snapshots() {
        let sub = StateSubscriber::new(Counter);
        sub.initialize(anchor(100)).await.unwrap();
        sub.handle_log(&log_at(101)).await;
        sub.handle_log(&log_at(102)).await;

        sub.rollback(anchor(100));

        assert_eq!(sub.last_seen(), Some(anchor(100)));
        assert_eq!(sub.current_state(), Some(0));
        assert!(sub.state_at(101).is_none());
        assert!(sub.state_at(102).is_none());
    }

    #[tokio::test]
    async fn test_reinitialize_clears_history() {
        let sub = StateSubscriber::new(Counter);
        sub.initialize(anchor(100)).await.unwrap();
        sub.handle_log(&log_at(101)).await;

        sub.initialize(anchor(200)).await.unwrap();

        assert!(sub.state_at(101).is_none());
        assert_eq!(sub.current_state(), Some(0));
        assert_eq!(sub.last_seen(), Some(anchor(200)));
    }

    #[tokio::test]
    async fn test_ignores_logs_before_initialization() {
        let sub = StateSubscriber::new(Counter);
        sub.handle_log(&log_at(101)).await;
        assert!(sub.current_state().is_none());
    }
}
