//! A bounded cache of the most recent canonical blocks.

use std::collections::BTreeMap;

use alloy_primitives::B256;

use crate::common::{BlockInfo, BlockRef};

/// Bounded, ordered map of recent canonical blocks keyed by block number.
///
/// The cache holds a contiguous suffix of the canonical chain: every entry
/// chains onto the previous one by parent hash, the entry with the highest
/// number is the head, and once `max_block_cached` entries are held the
/// numerically smallest entry is evicted on insert.
#[derive(Debug, Clone)]
pub struct ChainCache {
    blocks: BTreeMap<u64, BlockInfo>,
    max_block_cached: usize,
}

impl ChainCache {
    /// Creates an empty cache holding at most `max_block_cached` blocks.
    pub fn new(max_block_cached: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            max_block_cached,
        }
    }

    /// Resets the cache to the single given entry.
    ///
    /// The anchor's parent hash is unknown; chaining is only enforced between
    /// the anchor and the blocks appended after it.
    pub fn anchor(&mut self, anchor: BlockRef) {
        self.blocks.clear();
        self.blocks.insert(
            anchor.number,
            BlockInfo {
                number: anchor.number,
                hash: anchor.hash,
                parent_hash: B256::ZERO,
            },
        );
    }

    /// Appends the next canonical block and evicts the oldest entry if the
    /// cache is over capacity.
    ///
    /// # Panics
    ///
    /// Panics if the cache is empty or if `block` does not chain onto the
    /// current head; callers must verify parent linkage beforehand.
    pub fn append(&mut self, block: BlockInfo) {
        let head = self.head().expect("append on an empty chain cache");
        assert_eq!(
            block.parent_hash, head.hash,
            "block {} does not chain onto cached head {}",
            block.number, head.number
        );

        self.blocks.insert(block.number, block);

        while self.blocks.len() > self.max_block_cached {
            self.blocks.pop_first();
        }
    }

    /// Drops every entry with a number strictly above `number`.
    pub fn truncate_above(&mut self, number: u64) {
        self.blocks.split_off(&(number + 1));
    }

    /// Returns the cached block at `number`, if any.
    pub fn get(&self, number: u64) -> Option<&BlockInfo> {
        self.blocks.get(&number)
    }

    /// The entry with the highest block number.
    pub fn head(&self) -> Option<&BlockInfo> {
        self.blocks.last_key_value().map(|(_, block)| block)
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True while the cache has not been anchored yet.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
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
    fn test_anchor_resets_to_single_entry() {
        let mut cache = ChainCache::new(4);
        cache.anchor(block(100, 1, 0).as_ref());
        cache.append(block(101, 2, 1));

        cache.anchor(block(200, 9, 0).as_ref());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.head().unwrap().number, 200);
        assert_eq!(cache.head().unwrap().hash, B256::repeat_byte(9));
    }

    #[test]
    fn test_append_evicts_oldest() {
        let mut cache = ChainCache::new(3);
        cache.anchor(block(100, 1, 0).as_ref());
        cache.append(block(101, 2, 1));
        cache.append(block(102, 3, 2));
        cache.append(block(103, 4, 3));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(100).is_none());
        assert_eq!(cache.head().unwrap().number, 103);
    }

    #[test]
    #[should_panic(expected = "does not chain")]
    fn test_append_rejects_broken_chain() {
        let mut cache = ChainCache::new(3);
        cache.anchor(block(100, 1, 0).as_ref());
        cache.append(block(101, 2, 7));
    }

    #[test]
    fn test_truncate_above_keeps_prefix() {
        let mut cache = ChainCache::new(8);
        cache.anchor(block(100, 1, 0).as_ref());
        cache.append(block(101, 2, 1));
        cache.append(block(102, 3, 2));

        cache.truncate_above(100);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.head().unwrap().number, 100);
    }
}
