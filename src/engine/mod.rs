//! The core block ingest engine.
//!
//! [BlockEngine] consumes block headers, reconciles them against the cached
//! chain tail, detects and repairs reorgs, queries logs for the affected
//! ranges, and fans them out to the registered subscribers in a strictly
//! ordered fashion. One mutex around the engine state serializes all block
//! handling; concurrency exists only between header arrival and the drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::{
    common::{BlockInfo, BlockRef, EventLog},
    provider::{ChainProvider, ProviderError},
    subscription::{AddressAndTopics, LogSubscriber, SubscriptionRegistry},
    telemetry::metrics,
};

pub mod cache;
pub use cache::ChainCache;

pub mod reorg;
pub use reorg::AncestorError;
use reorg::{repair_zero_hash, ReorgOutcome};

pub mod logs;
use logs::QueryOutcome;

mod subscribers;

/// Tuning options for the [BlockEngine].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Maximum number of blocks held in the chain cache; bounds how deep a
    /// reorg can be repaired without a full re-initialization.
    pub max_block_cached: usize,
    /// Width of batched RPC block fetches. Must be at least
    /// `max_block_cached` so one batch can be scanned against the whole
    /// cache during ancestor search.
    pub batch_size: usize,
    /// Retry budget for block fetches.
    pub max_retry_get_block: u32,
    /// Delay between block fetch retries, in milliseconds.
    pub retry_delay_get_block_ms: u64,
    /// Retry budget for log fetches.
    pub max_retry_get_logs: u32,
    /// Delay between log fetch retries, in milliseconds.
    pub retry_delay_get_logs_ms: u64,
    /// Per-call deadline for log fetches, in milliseconds.
    pub get_logs_timeout_ms: u64,
    /// Pause between gap-fill chunks, in milliseconds. Zero disables the
    /// throttle.
    pub batch_chunk_delay_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_block_cached: 32,
            batch_size: 64,
            max_retry_get_block: 5,
            retry_delay_get_block_ms: 500,
            max_retry_get_logs: 5,
            retry_delay_get_logs_ms: 1_000,
            get_logs_timeout_ms: 30_000,
            batch_chunk_delay_ms: 0,
        }
    }
}

impl EngineOptions {
    /// Checks the construction-time constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_block_cached < 1 {
            eyre::bail!("max_block_cached must be at least 1");
        }
        if self.max_block_cached > self.batch_size {
            eyre::bail!(
                "max_block_cached ({}) must not exceed batch_size ({})",
                self.max_block_cached,
                self.batch_size
            );
        }
        Ok(())
    }

    pub(crate) fn retry_delay_get_block(&self) -> Duration {
        Duration::from_millis(self.retry_delay_get_block_ms)
    }

    pub(crate) fn retry_delay_get_logs(&self) -> Duration {
        Duration::from_millis(self.retry_delay_get_logs_ms)
    }

    pub(crate) fn get_logs_timeout(&self) -> Duration {
        Duration::from_millis(self.get_logs_timeout_ms)
    }

    pub(crate) fn batch_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.batch_chunk_delay_ms)
    }
}

/// Errors surfaced by [BlockEngine::handle_block]. Transient RPC failures
/// are absorbed by the retry loops; these are the structural failures left
/// over once a budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// `handle_block` was called before the engine was anchored.
    #[error("engine has not been initialized with an anchor block")]
    Uninitialized,
    /// The node could not return a requested block.
    #[error("block not found")]
    BlockNotFound,
    /// A retry budget was exhausted.
    #[error("retry budget exhausted")]
    MaxRetryReached,
    /// The node returned a log that cannot be verified against any known
    /// block.
    #[error("failed fetching logs: {0}")]
    FailedFetchingLog(String),
}

/// The outcome of handling one header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHandled {
    /// Logs applied to subscribers while handling the header, ascending
    /// `(block_number, log_index)`.
    pub logs: Vec<EventLog>,
    /// Set when subscribers were rolled back to this block. A rollback equal
    /// to the handled header itself means the fork was deeper than the cache
    /// and the engine re-anchored; callers should treat that as a fresh
    /// start.
    pub rollback: Option<BlockRef>,
}

/// Everything guarded by the engine mutex.
pub(crate) struct EngineState {
    pub(crate) cache: ChainCache,
    pub(crate) registry: SubscriptionRegistry,
    hooks: Vec<Box<dyn FnOnce(BlockRef) + Send>>,
}

/// The block-chain consistency engine. See the [module docs](self) for the
/// overall data flow.
pub struct BlockEngine<P> {
    pub(crate) provider: Arc<P>,
    pub(crate) options: EngineOptions,
    state: Mutex<EngineState>,
}

impl<P> std::fmt::Debug for BlockEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<P: ChainProvider> BlockEngine<P> {
    /// Creates a new engine. Errors if the options are inconsistent.
    pub fn new(provider: Arc<P>, options: EngineOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            provider,
            state: Mutex::new(EngineState {
                cache: ChainCache::new(options.max_block_cached),
                registry: SubscriptionRegistry::new(),
                hooks: Vec::new(),
            }),
            options,
        })
    }

    /// Anchors the engine at the given block. Any prior cache content is
    /// discarded and every registered subscriber is scheduled for a fresh
    /// initialization at the anchor.
    pub async fn initialize(&self, anchor: BlockRef) {
        let mut state = self.state.lock().await;

        state.cache.anchor(anchor);
        state.registry.reset_all();
        self.handle_subscribers_initialize(&mut state, anchor).await;

        metrics::HEAD_BLOCK.set(anchor.number as i64);
        metrics::CACHE_DEPTH.set(1);
        tracing::info!(number = anchor.number, hash = %anchor.hash, "engine anchored");
    }

    /// The cached chain head, if the engine has been anchored.
    pub async fn head(&self) -> Option<BlockInfo> {
        self.state.lock().await.cache.head().copied()
    }

    /// Number of blocks currently held in the chain cache.
    pub async fn cache_depth(&self) -> usize {
        self.state.lock().await.cache.len()
    }

    /// Registers a subscriber for all logs emitted by the given address and
    /// immediately attempts to initialize it at the current head. One
    /// subscriber is kept per address; a second subscription replaces the
    /// first.
    pub async fn subscribe_to_logs(
        &self,
        sub: AddressAndTopics,
        subscriber: Arc<dyn LogSubscriber>,
    ) {
        let mut state = self.state.lock().await;
        let address = sub.address;

        state.registry.insert(sub, subscriber);
        metrics::SUBSCRIPTIONS.set(state.registry.len() as i64);
        tracing::info!(address = %address.to_checksum(None), "subscription registered");

        if let Some(head) = state.cache.head().map(|block| block.as_ref()) {
            self.handle_subscribers_initialize(&mut state, head).await;
        }
    }

    /// Registers a one-shot closure invoked with the new head after the next
    /// successor block completes. Headers taking the gap or reorg paths
    /// leave the hook queued; it fires once the chain advances normally
    /// again.
    pub async fn on_next_block(&self, hook: impl FnOnce(BlockRef) + Send + 'static) {
        self.state.lock().await.hooks.push(Box::new(hook));
    }

    /// Handles one inbound header: classifies it against the cached tail,
    /// repairs reorgs, fetches and applies logs, and reports what happened.
    pub async fn handle_block(&self, new_block: BlockInfo) -> Result<BlockHandled, EngineError> {
        let mut state = self.state.lock().await;
        let result = self.handle_block_inner(&mut state, new_block).await;

        if let Some(head) = state.cache.head() {
            metrics::HEAD_BLOCK.set(head.number as i64);
        }
        metrics::CACHE_DEPTH.set(state.cache.len() as i64);

        result
    }

    async fn handle_block_inner(
        &self,
        state: &mut EngineState,
        new_block: BlockInfo,
    ) -> Result<BlockHandled, EngineError> {
        let head = *state.cache.head().ok_or(EngineError::Uninitialized)?;

        if state.cache.get(new_block.number).map(|b| b.hash) == Some(new_block.hash) {
            tracing::debug!(number = new_block.number, "duplicate header, skipping");
            return Ok(BlockHandled::default());
        }

        if new_block.number > head.number + 1 {
            self.handle_gap(state, new_block).await
        } else if new_block.parent_hash != head.hash {
            self.handle_fork(state, new_block).await
        } else {
            self.handle_successor(state, head, new_block).await
        }
    }

    /// Drains the one-shot post-block hooks against the current head. Only
    /// the successor path runs hooks; the gap and reorg paths leave them
    /// queued so a hook never observes a head that is mid-repair.
    fn run_post_block_hooks(&self, state: &mut EngineState) {
        if state.hooks.is_empty() {
            return;
        }
        let Some(head) = state.cache.head().map(|block| block.as_ref()) else {
            return;
        };
        for hook in std::mem::take(&mut state.hooks) {
            hook(head);
        }
    }

    /// The common case: the header chains directly onto the cached head.
    async fn handle_successor(
        &self,
        state: &mut EngineState,
        head: BlockInfo,
        new_block: BlockInfo,
    ) -> Result<BlockHandled, EngineError> {
        tracing::debug!(number = new_block.number, "handling successor block");

        // The announced header stands in for the not-yet-cached block while
        // its logs are verified.
        let announced = HashMap::from([(new_block.number, new_block)]);

        match self
            .query_logs(state, head, new_block, None, Some(&announced))
            .await?
        {
            QueryOutcome::ReAnchored(anchor) => Ok(self.finish_reanchor(state, anchor).await),
            QueryOutcome::Logs(query) => {
                let rollback = query.common_ancestor.map(|block| block.as_ref());
                match query.common_ancestor {
                    Some(ancestor) => self.rollback_subscribers(state, ancestor.as_ref()),
                    None => state.cache.append(new_block),
                }

                self.apply_logs(state, &query.logs).await;
                if let Some(head) = state.cache.head().map(|block| block.as_ref()) {
                    self.handle_subscribers_initialize(state, head).await;
                }
                self.run_post_block_hooks(state);

                Ok(BlockHandled {
                    logs: query.logs,
                    rollback,
                })
            }
        }
    }

    /// A header that does not chain onto the head: the remote chain forked.
    async fn handle_fork(
        &self,
        state: &mut EngineState,
        new_block: BlockInfo,
    ) -> Result<BlockHandled, EngineError> {
        tracing::warn!(
            number = new_block.number,
            hash = %new_block.hash,
            "reorg detected at the chain head"
        );

        match self.resolve_reorg(&mut state.cache, &new_block).await? {
            ReorgOutcome::ReAnchored(anchor) => Ok(self.finish_reanchor(state, anchor).await),
            ReorgOutcome::Ancestor(ancestor) => {
                match self
                    .query_logs(state, ancestor, new_block, Some(ancestor), None)
                    .await?
                {
                    QueryOutcome::ReAnchored(anchor) => {
                        Ok(self.finish_reanchor(state, anchor).await)
                    }
                    QueryOutcome::Logs(query) => {
                        let target = query.common_ancestor.unwrap_or(ancestor);

                        self.rollback_subscribers(state, target.as_ref());
                        self.apply_logs(state, &query.logs).await;
                        if let Some(head) = state.cache.head().map(|block| block.as_ref()) {
                            self.handle_subscribers_initialize(state, head).await;
                        }

                        Ok(BlockHandled {
                            logs: query.logs,
                            rollback: Some(target.as_ref()),
                        })
                    }
                }
            }
        }
    }

    /// The header is more than one block ahead: walk the gap in chunks of at
    /// most `batch_size` blocks, applying logs as each chunk lands.
    async fn handle_gap(
        &self,
        state: &mut EngineState,
        new_block: BlockInfo,
    ) -> Result<BlockHandled, EngineError> {
        let mut collected = Vec::new();
        let mut deepest_rollback: Option<BlockInfo> = None;
        let batch = self.options.batch_size as u64;

        tracing::info!(to = new_block.number, "filling header gap");

        loop {
            let head = *state.cache.head().ok_or(EngineError::Uninitialized)?;
            if head.number >= new_block.number {
                break;
            }

            let from = head.number + 1;
            let to = new_block.number.min(from + batch - 1);

            // Fetch one extra leading block so the first chunk entry can be
            // verified against its parent.
            let mut blocks = self.fetch_chunk(from - 1, to).await?;
            repair_zero_hash(&mut blocks, &new_block);

            if blocks.first().map(|b| b.number) != Some(from - 1) {
                return Err(EngineError::BlockNotFound);
            }
            blocks.remove(0);

            let Some(&first) = blocks.first() else {
                return Err(EngineError::BlockNotFound);
            };
            let to_block = *blocks.last().expect("chunk is non-empty");
            let chunk: HashMap<u64, BlockInfo> =
                blocks.iter().map(|block| (block.number, *block)).collect();

            if head.hash != first.parent_hash {
                // A reorg overlaps the gap.
                match self.resolve_reorg(&mut state.cache, &to_block).await? {
                    ReorgOutcome::ReAnchored(anchor) => {
                        return Ok(self.finish_reanchor(state, anchor).await)
                    }
                    ReorgOutcome::Ancestor(ancestor) => {
                        match self
                            .query_logs(state, ancestor, to_block, Some(ancestor), Some(&chunk))
                            .await?
                        {
                            QueryOutcome::ReAnchored(anchor) => {
                                return Ok(self.finish_reanchor(state, anchor).await)
                            }
                            QueryOutcome::Logs(query) => {
                                let target = query.common_ancestor.unwrap_or(ancestor);
                                deepest_rollback = Some(deepest(deepest_rollback, target));

                                self.rollback_subscribers(state, target.as_ref());
                                self.apply_logs(state, &query.logs).await;
                                collected.extend(query.logs);
                            }
                        }
                    }
                }
            } else {
                match self
                    .query_logs(state, head, to_block, None, Some(&chunk))
                    .await?
                {
                    QueryOutcome::ReAnchored(anchor) => {
                        return Ok(self.finish_reanchor(state, anchor).await)
                    }
                    QueryOutcome::Logs(query) => {
                        match query.common_ancestor {
                            Some(ancestor) => {
                                deepest_rollback = Some(deepest(deepest_rollback, ancestor));
                                self.rollback_subscribers(state, ancestor.as_ref());
                            }
                            None => {
                                for number in first.number..=to_block.number {
                                    let block = chunk[&number];
                                    state.cache.append(block);
                                }
                            }
                        }

                        self.apply_logs(state, &query.logs).await;
                        collected.extend(query.logs);
                    }
                }
            }

            if let Some(head) = state.cache.head().map(|block| block.as_ref()) {
                self.handle_subscribers_initialize(state, head).await;
            }

            let behind = state
                .cache
                .head()
                .map(|block| block.number < new_block.number)
                .unwrap_or(false);
            if behind && self.options.batch_chunk_delay_ms > 0 {
                // Give the node room to catch up before the next chunk.
                sleep(self.options.batch_chunk_delay()).await;
            }
        }

        Ok(BlockHandled {
            logs: collected,
            rollback: deepest_rollback.map(|block| block.as_ref()),
        })
    }

    /// A fork deeper than the cache was re-anchored at `anchor`; dispatch the
    /// subscriber rollbacks and report the fresh start.
    async fn finish_reanchor(&self, state: &mut EngineState, anchor: BlockRef) -> BlockHandled {
        self.rollback_subscribers(state, anchor);
        self.handle_subscribers_initialize(state, anchor).await;

        BlockHandled {
            logs: Vec::new(),
            rollback: Some(anchor),
        }
    }

    /// One batched block fetch with the block retry budget applied to
    /// transient failures.
    async fn fetch_chunk(&self, from: u64, to: u64) -> Result<Vec<BlockInfo>, EngineError> {
        let mut attempt = 0;

        loop {
            match self.provider.batch_get_blocks(from, to).await {
                Ok(blocks) => return Ok(blocks),
                Err(ProviderError::BlockNotFound) => return Err(EngineError::BlockNotFound),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.max_retry_get_block {
                        return Err(EngineError::MaxRetryReached);
                    }
                    tracing::debug!(%err, attempt, "batch block fetch failed, retrying");
                    sleep(self.options.retry_delay_get_block()).await;
                }
            }
        }
    }
}

/// The deeper (numerically smaller) of an optional current rollback target
/// and a new candidate.
pub(crate) fn deepest(current: Option<BlockInfo>, candidate: BlockInfo) -> BlockInfo {
    match current {
        Some(block) if block.number <= candidate.number => block,
        _ => candidate,
    }
}
