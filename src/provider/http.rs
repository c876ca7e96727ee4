//! HTTP [ChainProvider] backed by an alloy provider.

use alloy_primitives::Address;
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::{BatchRequest, Waiter};
use alloy_rpc_types::{Block, BlockNumberOrTag, Filter};
use async_trait::async_trait;
use eyre::Result;
use reqwest::Url;

use crate::common::{BlockInfo, EventLog};

use super::{ChainProvider, ProviderError};

/// [ChainProvider] implementation speaking JSON-RPC over HTTP.
///
/// Block ranges are fetched with a single JSON-RPC batch per call rather than
/// one round-trip per block.
#[derive(Debug)]
pub struct HttpProvider {
    inner: RootProvider,
}

impl HttpProvider {
    /// Creates a new [HttpProvider]. Errors if the rpc url is invalid.
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url = Url::parse(rpc_url)?;
        Ok(Self {
            inner: RootProvider::new_http(url),
        })
    }
}

fn rpc_err(err: impl ToString) -> ProviderError {
    ProviderError::Rpc(err.to_string())
}

#[async_trait]
impl ChainProvider for HttpProvider {
    async fn latest_block(&self) -> Result<BlockInfo, ProviderError> {
        let block = self
            .inner
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(rpc_err)?
            .ok_or(ProviderError::BlockNotFound)?;

        Ok(BlockInfo::from(&block))
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo, ProviderError> {
        let block = self
            .inner
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(rpc_err)?
            .ok_or(ProviderError::BlockNotFound)?;

        Ok(BlockInfo::from(&block))
    }

    async fn batch_get_blocks(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockInfo>, ProviderError> {
        let client = self.inner.client();
        let mut batch = BatchRequest::new(client);

        let mut waiters: Vec<Waiter<Option<Block>>> =
            Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for number in from..=to {
            let waiter = batch
                .add_call(
                    "eth_getBlockByNumber",
                    &(BlockNumberOrTag::Number(number), false),
                )
                .map_err(rpc_err)?;
            waiters.push(waiter);
        }

        batch.send().await.map_err(rpc_err)?;

        let mut blocks = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            let block = waiter
                .await
                .map_err(rpc_err)?
                .ok_or(ProviderError::BlockNotFound)?;
            blocks.push(BlockInfo::from(&block));
        }

        Ok(blocks)
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<EventLog>, ProviderError> {
        let filter = Filter::new()
            .address(addresses.to_vec())
            .from_block(from)
            .to_block(to);

        let raw = self.inner.get_logs(&filter).await.map_err(rpc_err)?;

        let mut logs = Vec::with_capacity(raw.len());
        for log in raw {
            logs.push(EventLog::try_from(log).map_err(rpc_err)?);
        }

        // Normalize ordering; the engine relies on ascending delivery.
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        Ok(logs)
    }
}
