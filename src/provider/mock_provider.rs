//! Mock [ChainProvider] serving a scripted chain.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use alloy_primitives::Address;
use async_trait::async_trait;

use crate::common::{BlockInfo, EventLog};

use super::{ChainProvider, ProviderError};

/// Mock chain provider that serves preset blocks and logs.
///
/// Tests script the canonical chain up front, swap it mid-run to simulate a
/// reorg, and enqueue transient errors; every `batch_get_blocks` and
/// `get_logs` call is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockProvider {
    inner: Mutex<MockChain>,
}

#[derive(Debug, Default)]
struct MockChain {
    blocks: BTreeMap<u64, BlockInfo>,
    logs: Vec<EventLog>,
    get_logs_errors: VecDeque<String>,
    batch_errors: VecDeque<String>,
    get_logs_calls: Vec<(u64, u64)>,
    batch_calls: Vec<(u64, u64)>,
}

impl MockProvider {
    /// Creates an empty mock chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the canonical chain served by the mock.
    pub fn set_chain(&self, blocks: Vec<BlockInfo>) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks = blocks.into_iter().map(|b| (b.number, b)).collect();
    }

    /// Appends one block to the served chain.
    pub fn push_block(&self, block: BlockInfo) {
        self.inner.lock().unwrap().blocks.insert(block.number, block);
    }

    /// Replaces the log set served by the mock.
    pub fn set_logs(&self, logs: Vec<EventLog>) {
        self.inner.lock().unwrap().logs = logs;
    }

    /// Enqueues a transient `get_logs` failure; each queued message fails one
    /// call before the mock resumes serving logs.
    pub fn fail_get_logs(&self, message: &str, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..times {
            inner.get_logs_errors.push_back(message.to_string());
        }
    }

    /// Enqueues a transient `batch_get_blocks` failure.
    pub fn fail_batch_get_blocks(&self, message: &str, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..times {
            inner.batch_errors.push_back(message.to_string());
        }
    }

    /// The `(from, to)` ranges of every `get_logs` call so far.
    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().get_logs_calls.clone()
    }

    /// The `(from, to)` ranges of every `batch_get_blocks` call so far.
    pub fn batch_calls(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().batch_calls.clone()
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn latest_block(&self) -> Result<BlockInfo, ProviderError> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .last_key_value()
            .map(|(_, block)| *block)
            .ok_or(ProviderError::BlockNotFound)
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo, ProviderError> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .get(&number)
            .copied()
            .ok_or(ProviderError::BlockNotFound)
    }

    async fn batch_get_blocks(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockInfo>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.batch_calls.push((from, to));

        if let Some(message) = inner.batch_errors.pop_front() {
            return Err(ProviderError::Rpc(message));
        }

        let mut blocks = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for number in from..=to {
            let block = inner
                .blocks
                .get(&number)
                .copied()
                .ok_or(ProviderError::BlockNotFound)?;
            blocks.push(block);
        }

        Ok(blocks)
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<EventLog>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_logs_calls.push((from, to));

        if let Some(message) = inner.get_logs_errors.pop_front() {
            return Err(ProviderError::Rpc(message));
        }

        let mut logs: Vec<EventLog> = inner
            .logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .filter(|log| addresses.contains(&log.address))
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        Ok(logs)
    }
}
