//! Reorg resolution: common ancestor search and chain repair.

use std::collections::HashMap;

use alloy_primitives::B256;
use thiserror::Error;
use tokio::time::sleep;

use crate::common::{BlockInfo, BlockRef};
use crate::provider::{ChainProvider, ProviderError};
use crate::telemetry::metrics;

use super::{cache::ChainCache, BlockEngine, EngineError};

/// Failure modes of the common ancestor search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AncestorError {
    /// The fork is deeper than the cached chain tail.
    #[error("no common ancestor found in cache")]
    NoCommonAncestorFoundInCache,
    /// The canonical chain could not be fetched within the retry budget.
    #[error("failed to fetch blocks while searching for a common ancestor")]
    FailedGetBlock,
}

/// How a detected reorg was repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReorgOutcome {
    /// The cache was truncated to this common ancestor and re-chained up to
    /// the reorg target.
    Ancestor(BlockInfo),
    /// The fork was deeper than the cache; it was re-anchored at the target.
    ReAnchored(BlockRef),
}

impl<P: ChainProvider> BlockEngine<P> {
    /// Finds the deepest cached block that is still on the canonical chain.
    ///
    /// One batch covering the whole cache depth replaces a round-trip per
    /// cached block; `max_block_cached <= batch_size` guarantees the batch
    /// spans every cached entry. A single-entry cache has no depth to
    /// compare and resolves to [AncestorError::NoCommonAncestorFoundInCache].
    pub(crate) async fn find_common_ancestor(
        &self,
        cache: &ChainCache,
    ) -> Result<BlockInfo, AncestorError> {
        if cache.len() <= 1 {
            return Err(AncestorError::NoCommonAncestorFoundInCache);
        }

        let head = *cache.head().expect("cache is non-empty");
        let from = head.number.saturating_sub(self.options.batch_size as u64);

        let mut attempt = 0;
        let canonical = loop {
            match self.provider.batch_get_blocks(from, head.number).await {
                Ok(blocks) => break blocks,
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.max_retry_get_block {
                        tracing::warn!(%err, "giving up on common ancestor search");
                        return Err(AncestorError::FailedGetBlock);
                    }
                    tracing::debug!(%err, attempt, "failed to fetch canonical chain, retrying");
                    sleep(self.options.retry_delay_get_block()).await;
                }
            }
        };

        let remote: HashMap<u64, B256> = canonical
            .iter()
            .map(|block| (block.number, block.hash))
            .collect();

        for depth in 0..cache.len() as u64 {
            let number = head.number - depth;
            let Some(cached) = cache.get(number) else {
                break;
            };
            if remote.get(&number) == Some(&cached.hash) {
                return Ok(*cached);
            }
        }

        Err(AncestorError::NoCommonAncestorFoundInCache)
    }

    /// Extends the cache from its head up to `target`, verifying parent-hash
    /// continuity at every step. A mismatching tail means the node answered
    /// from an already-reorged view; the fetch is retried after a delay.
    pub(crate) async fn populate_until(
        &self,
        cache: &mut ChainCache,
        target: &BlockInfo,
    ) -> Result<(), EngineError> {
        let mut attempt = 0;

        'fetch: loop {
            let head = *cache.head().ok_or(EngineError::Uninitialized)?;
            if head.number >= target.number {
                return Ok(());
            }

            let mut blocks = match self
                .provider
                .batch_get_blocks(head.number + 1, target.number)
                .await
            {
                Ok(blocks) => blocks,
                Err(ProviderError::BlockNotFound) => return Err(EngineError::BlockNotFound),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.max_retry_get_block {
                        return Err(EngineError::MaxRetryReached);
                    }
                    tracing::debug!(%err, attempt, "failed to fetch repair blocks, retrying");
                    sleep(self.options.retry_delay_get_block()).await;
                    continue;
                }
            };

            repair_zero_hash(&mut blocks, target);

            for block in blocks {
                let head = cache.head().expect("cache is non-empty");
                if block.parent_hash != head.hash {
                    attempt += 1;
                    if attempt > self.options.max_retry_get_block {
                        return Err(EngineError::MaxRetryReached);
                    }
                    tracing::debug!(
                        number = block.number,
                        attempt,
                        "repair batch does not chain onto the cache, retrying"
                    );
                    sleep(self.options.retry_delay_get_block()).await;
                    continue 'fetch;
                }
                cache.append(block);
            }
        }
    }

    /// Re-establishes a consistent cache after a fork: truncates to the
    /// common ancestor and re-chains up to `target`, or re-anchors at
    /// `target` when the fork is deeper than the cache.
    pub(crate) async fn resolve_reorg(
        &self,
        cache: &mut ChainCache,
        target: &BlockInfo,
    ) -> Result<ReorgOutcome, EngineError> {
        metrics::REORGS_DETECTED.inc();

        match self.find_common_ancestor(cache).await {
            Ok(ancestor) => {
                tracing::info!(
                    number = ancestor.number,
                    hash = %ancestor.hash,
                    "rewinding to common ancestor"
                );
                cache.truncate_above(ancestor.number);
                self.populate_until(cache, target).await?;
                Ok(ReorgOutcome::Ancestor(ancestor))
            }
            Err(AncestorError::NoCommonAncestorFoundInCache) => {
                tracing::warn!(
                    number = target.number,
                    "reorg deeper than the cache, re-anchoring"
                );
                cache.anchor(target.as_ref());
                Ok(ReorgOutcome::ReAnchored(target.as_ref()))
            }
            Err(AncestorError::FailedGetBlock) => Err(EngineError::MaxRetryReached),
        }
    }
}

/// Multicall-style batch fetchers occasionally report an empty hash for the
/// newest block. When the final slot matches the externally announced header
/// number, its hash is replaced with the announced one. No other hash repair
/// is permitted.
pub(crate) fn repair_zero_hash(blocks: &mut [BlockInfo], announced: &BlockInfo) {
    if let Some(last) = blocks.last_mut() {
        if last.hash == B256::ZERO && last.number == announced.number {
            last.hash = announced.hash;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: u8, parent: u8) -> BlockInfo {
        BlockInfo {
            number,
            hash: B256::repeat_byte(hash),
            parent_hash: B256::repeat_byte(parent),
        }
    }

    #[test]
    fn test_repair_zero_hash_fills_announced_tip() {
        let announced = block(105, 9, 8);
        let mut blocks = vec![
            block(104, 8, 7),
            BlockInfo {
                number: 105,
                hash: B256::ZERO,
                parent_hash: B256::repeat_byte(8),
            },
        ];

        repair_zero_hash(&mut blocks, &announced);

        assert_eq!(blocks[1].hash, B256::repeat_byte(9));
    }

    #[test]
    fn test_repair_zero_hash_ignores_other_numbers() {
        let announced = block(106, 9, 8);
        let mut blocks = vec![BlockInfo {
            number: 105,
            hash: B256::ZERO,
            parent_hash: B256::repeat_byte(8),
        }];

        repair_zero_hash(&mut blocks, &announced);

        assert_eq!(blocks[0].hash, B256::ZERO);
    }
}
