//! Module containing common types and functions used throughout the crate.

use alloy_primitives::{Address, Bytes, B256};
use alloy_rpc_types::{Block, Log};
use eyre::Result;
use serde::{Deserialize, Serialize};

/// Selected block header info
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    /// The block number
    pub number: u64,
    /// The block hash
    pub hash: B256,
    /// The parent block hash
    pub parent_hash: B256,
}

/// A reference to a block by number and hash, without its parent hash.
/// Used to anchor the chain cache and to mark rollback targets, where the
/// parent linkage is unknown or irrelevant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockRef {
    /// The block number
    pub number: u64,
    /// The block hash
    pub hash: B256,
}

impl BlockInfo {
    /// Returns the [BlockRef] for this block.
    pub fn as_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash,
        }
    }
}

impl From<BlockInfo> for BlockRef {
    fn from(block: BlockInfo) -> Self {
        block.as_ref()
    }
}

/// A single event log emitted by a contract, as delivered to subscribers.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct EventLog {
    /// The number of the block containing the log
    pub block_number: u64,
    /// The hash of the block containing the log
    pub block_hash: B256,
    /// The hash of the transaction that emitted the log
    pub transaction_hash: B256,
    /// The index of the transaction within its block
    pub transaction_index: u64,
    /// The index of the log within its block
    pub log_index: u64,
    /// The address of the emitting contract
    pub address: Address,
    /// The log topics
    pub topics: Vec<B256>,
    /// The raw log payload
    pub data: Bytes,
    /// Whether the log was removed by a reorg, as reported by the node
    pub removed: bool,
}

impl From<&Block> for BlockInfo {
    /// Converts a [Block] to [BlockInfo]
    fn from(block: &Block) -> Self {
        BlockInfo {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
        }
    }
}

impl TryFrom<Log> for EventLog {
    type Error = eyre::Report;

    /// Converts an rpc [Log] to an [EventLog]. Errors on pending logs that
    /// are not yet included in a block.
    fn try_from(log: Log) -> Result<Self> {
        let block_number = log.block_number.ok_or(eyre::eyre!("log not included"))?;
        let block_hash = log.block_hash.ok_or(eyre::eyre!("log not included"))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or(eyre::eyre!("log without transaction"))?;

        Ok(EventLog {
            block_number,
            block_hash,
            transaction_hash,
            transaction_index: log.transaction_index.unwrap_or_default(),
            log_index: log.log_index.unwrap_or_default(),
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            removed: log.removed,
        })
    }
}
