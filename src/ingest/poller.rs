//! Polling header source.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::{
    spawn,
    sync::watch,
    task::JoinHandle,
    time::sleep,
};

use crate::provider::ChainProvider;

use super::IngestQueue;

/// Polls the chain head at a fixed interval and feeds fresh headers into the
/// ingest queue. On start the engine is anchored at the current head, so the
/// first pushed header chains directly onto the anchor (or opens a gap the
/// engine fills). Dropping the poller aborts the polling task.
pub struct HeaderPoller<P> {
    provider: Arc<P>,
    queue: Arc<IngestQueue<P>>,
    poll_interval: Duration,
    stop_sender: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl<P> std::fmt::Debug for HeaderPoller<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderPoller")
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl<P> Drop for HeaderPoller<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<P: ChainProvider> HeaderPoller<P> {
    /// Creates a poller over the given provider and queue.
    pub fn new(provider: Arc<P>, queue: Arc<IngestQueue<P>>, poll_interval: Duration) -> Self {
        let (stop_sender, _) = watch::channel(false);
        Self {
            provider,
            queue,
            poll_interval,
            stop_sender,
            handle: None,
        }
    }

    /// Anchors the engine at the latest block and starts the polling task.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }

        let anchor = self
            .provider
            .latest_block()
            .await
            .map_err(|err| eyre::eyre!("could not fetch the chain head: {}", err))?;
        self.queue.engine().initialize(anchor.as_ref()).await;

        let provider = Arc::clone(&self.provider);
        let queue = Arc::clone(&self.queue);
        let interval = self.poll_interval;
        let mut stop = self.stop_sender.subscribe();
        let mut last_announced = anchor;

        self.handle = Some(spawn(async move {
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = sleep(interval) => {
                        match provider.latest_block().await {
                            Ok(block) => {
                                if block.hash != last_announced.hash {
                                    last_announced = block;
                                    queue.push(block);
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, "failed to poll the chain head");
                            }
                        }
                    }
                }
            }
            tracing::debug!("header poller stopped");
        }));

        Ok(())
    }

    /// Flips the stop flag and cancels the scheduled re-poll; an in-flight
    /// block handling pass is allowed to complete.
    pub fn stop(&self) {
        let _ = self.stop_sender.send(true);
    }
}
