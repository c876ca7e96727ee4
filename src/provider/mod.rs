//! Chain RPC providers.
//!
//! The engine talks to the remote node exclusively through the
//! [ChainProvider] trait so that the RPC backend can be swapped out, most
//! notably for the scripted [MockProvider] used by the test suite.

use alloy_primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::common::{BlockInfo, EventLog};

pub mod http;
pub use http::HttpProvider;

#[cfg(feature = "test-utils")]
pub mod mock_provider;
#[cfg(feature = "test-utils")]
pub use mock_provider::MockProvider;

/// Errors surfaced by a [ChainProvider].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The node could not return a requested block.
    #[error("block not found")]
    BlockNotFound,
    /// Any other RPC failure, carrying the node's error message.
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// ## ChainProvider
///
/// The subset of the execution-node RPC surface the engine relies on.
/// Implementations are expected to be cheap to share behind an [`Arc`](std::sync::Arc);
/// every method may be called concurrently from the poller and the engine.
#[async_trait]
pub trait ChainProvider: Send + Sync + 'static {
    /// Returns the current head of the canonical chain.
    async fn latest_block(&self) -> Result<BlockInfo, ProviderError>;

    /// Returns the canonical block at `number`.
    async fn get_block(&self, number: u64) -> Result<BlockInfo, ProviderError>;

    /// Returns the canonical blocks for `[from, to]` inclusive, in ascending
    /// order. A zero hash in the last slot is tolerated for the block at the
    /// very tip; the engine repairs it against the announced header.
    async fn batch_get_blocks(&self, from: u64, to: u64)
        -> Result<Vec<BlockInfo>, ProviderError>;

    /// Returns the logs emitted by `addresses` in `[from, to]` inclusive,
    /// ordered by ascending `(block_number, log_index)`.
    ///
    /// Callers short-circuit an empty address set; implementations may assume
    /// `addresses` is non-empty.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<EventLog>, ProviderError>;
}
