//! Module handles running the argus engine against a live node.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::watch::{channel, Receiver};

use crate::{
    common::{BlockRef, EventLog},
    config::Config,
    engine::BlockEngine,
    ingest::{HeaderPoller, IngestQueue},
    provider::HttpProvider,
    subscription::{AddressAndTopics, LogSubscriber},
    telemetry::metrics,
};

/// The main entrypoint for running argus. Wires the provider, engine, queue
/// and poller together and follows the chain head until a SIGINT arrives.
pub struct Runner {
    /// The argus [Config]
    config: Config,
    /// Receiver to listen for SIGINT signals
    shutdown_recv: Receiver<bool>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a new [Runner] from a [Config] and registers the SIGINT signal handler.
    pub fn from_config(config: Config) -> Self {
        let (shutdown_sender, shutdown_recv) = channel(false);
        ctrlc::set_handler(move || {
            tracing::info!("shutting down");
            shutdown_sender
                .send(true)
                .expect("could not send shutdown signal");
        })
        .expect("could not register shutdown handler");

        Self {
            config,
            shutdown_recv,
        }
    }

    /// Runs until shutdown.
    pub async fn run(mut self) -> Result<()> {
        if let Some(port) = self.config.metrics_port {
            metrics::init(port)?;
        }

        let provider = Arc::new(HttpProvider::new(&self.config.rpc_url)?);
        let engine = Arc::new(BlockEngine::new(Arc::clone(&provider), self.config.engine)?);
        let queue = IngestQueue::new(Arc::clone(&engine));

        for address in &self.config.watch_addresses {
            engine
                .subscribe_to_logs(AddressAndTopics::new(*address), Arc::new(EventPrinter))
                .await;
        }

        let mut poller = HeaderPoller::new(provider, queue, self.config.poll_interval());
        poller.start().await?;

        while self.shutdown_recv.changed().await.is_ok() {
            if *self.shutdown_recv.borrow() {
                poller.stop();
                break;
            }
        }

        Ok(())
    }
}

/// Subscriber that traces every event it sees; backs the `--watch` flag of
/// the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventPrinter;

#[async_trait]
impl LogSubscriber for EventPrinter {
    async fn initialize(&self, anchor: BlockRef) -> Result<()> {
        tracing::info!(number = anchor.number, hash = %anchor.hash, "watching from anchor");
        Ok(())
    }

    async fn handle_log(&self, log: &EventLog) {
        tracing::info!(
            address = %log.address.to_checksum(None),
            block = log.block_number,
            log_index = log.log_index,
            tx = %log.transaction_hash,
            "event"
        );
    }

    fn rollback(&self, block: BlockRef) {
        tracing::warn!(
            number = block.number,
            hash = %block.hash,
            "events above this block were reorged away"
        );
    }
}
