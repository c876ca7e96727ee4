//! Inbound header ingestion: the FIFO queue and the polling header source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::BlockInfo;
use crate::engine::BlockEngine;
use crate::provider::ChainProvider;

pub mod poller;
pub use poller::HeaderPoller;

/// FIFO of inbound headers drained serially into the [BlockEngine].
///
/// `push` appends the header and kicks a drain task unless one is already
/// running; headers arriving while a drain is active accumulate and are
/// picked up by the same pass. Handling of a single header is serialized by
/// the engine mutex, so ordering is preserved regardless of where arrivals
/// come from.
pub struct IngestQueue<P> {
    engine: Arc<BlockEngine<P>>,
    queue: Mutex<VecDeque<BlockInfo>>,
    draining: AtomicBool,
    this: Weak<Self>,
}

impl<P> std::fmt::Debug for IngestQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<P> IngestQueue<P> {
    /// Number of headers waiting to be handled.
    pub fn len(&self) -> usize {
        self.queue.lock().expect("ingest queue mutex poisoned").len()
    }

    /// True when no header is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<BlockInfo> {
        self.queue
            .lock()
            .expect("ingest queue mutex poisoned")
            .pop_front()
    }
}

impl<P: ChainProvider> IngestQueue<P> {
    /// Creates a queue feeding the given engine.
    pub fn new(engine: Arc<BlockEngine<P>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// The engine this queue feeds.
    pub fn engine(&self) -> &Arc<BlockEngine<P>> {
        &self.engine
    }

    /// Appends a header and kicks a drainer if none is active.
    pub fn push(&self, header: BlockInfo) {
        self.queue
            .lock()
            .expect("ingest queue mutex poisoned")
            .push_back(header);

        if !self.draining.swap(true, Ordering::AcqRel) {
            let Some(queue) = self.this.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
    }

    async fn drain(&self) {
        loop {
            while let Some(header) = self.pop() {
                match self.engine.handle_block(header).await {
                    Ok(handled) => {
                        if let Some(rollback) = handled.rollback {
                            tracing::info!(
                                number = header.number,
                                rollback = rollback.number,
                                "block handled with rollback"
                            );
                        } else {
                            tracing::debug!(
                                number = header.number,
                                logs = handled.logs.len(),
                                "block handled"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(number = header.number, %err, "failed to handle block");
                    }
                }
            }

            self.draining.store(false, Ordering::Release);

            // A producer may have pushed between the last pop and the flag
            // store; re-arm if the queue is non-empty and nobody else took
            // over.
            if self.is_empty() || self.draining.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }
}
