//! Subscriber orchestration: initialization, log dispatch and rollback.

use futures::future::join_all;

use crate::common::{BlockRef, EventLog};
use crate::provider::ChainProvider;
use crate::telemetry::metrics;

use super::{BlockEngine, EngineState};

impl<P: ChainProvider> BlockEngine<P> {
    /// Drains the waiting-init worklist, running the initializations
    /// concurrently. Failures are rescheduled for the next drain.
    pub(crate) async fn handle_subscribers_initialize(
        &self,
        state: &mut EngineState,
        block: BlockRef,
    ) {
        let waiting = state.registry.take_waiting();
        if waiting.is_empty() {
            return;
        }

        let jobs: Vec<_> = waiting
            .into_iter()
            .filter_map(|address| {
                state
                    .registry
                    .subscriber(&address)
                    .map(|subscriber| (address, subscriber))
            })
            .collect();

        let results = join_all(jobs.into_iter().map(|(address, subscriber)| async move {
            (address, subscriber.initialize(block).await)
        }))
        .await;

        for (address, result) in results {
            match result {
                Ok(()) => {
                    tracing::debug!(
                        address = %address.to_checksum(None),
                        number = block.number,
                        "subscriber initialized"
                    );
                    state.registry.mark_initialized(address, block);
                }
                Err(err) => {
                    tracing::warn!(
                        address = %address.to_checksum(None),
                        %err,
                        "subscriber initialization failed, rescheduling"
                    );
                    state.registry.requeue(address);
                }
            }
        }
    }

    /// Delivers logs to their subscribers one at a time, in stream order.
    pub(crate) async fn apply_logs(&self, state: &mut EngineState, logs: &[EventLog]) {
        for log in logs {
            let Some(subscriber) = state.registry.subscriber(&log.address) else {
                tracing::debug!(
                    address = %log.address.to_checksum(None),
                    "log without subscriber, skipping"
                );
                continue;
            };
            if !state.registry.wants(log) {
                continue;
            }
            if !state.registry.is_initialized(&log.address) {
                // initialize happens-before handle_log; the address is still
                // on the waiting list and catches up from its next anchor
                continue;
            }

            subscriber.handle_log(log).await;
            state.registry.mark_seen(
                log.address,
                BlockRef {
                    number: log.block_number,
                    hash: log.block_hash,
                },
            );
            metrics::LOGS_DELIVERED.inc();
        }
    }

    /// Applies the rollback dispatch rules for a fork at `target`: a
    /// subscriber whose anchor sits above the target must re-initialize, one
    /// that merely saw newer events is told to roll back, and the rest are
    /// untouched.
    pub(crate) fn rollback_subscribers(&self, state: &mut EngineState, target: BlockRef) {
        let mut reschedule = Vec::new();

        for (address, entry) in state.registry.entries_mut() {
            match (entry.initialized_at, entry.last_seen) {
                (Some(initialized_at), _) if initialized_at.number > target.number => {
                    entry.initialized_at = None;
                    entry.last_seen = None;
                    reschedule.push(*address);
                }
                (Some(_), Some(last_seen)) if last_seen.number > target.number => {
                    entry.subscriber.rollback(target);
                    entry.last_seen = Some(target);
                }
                _ => {}
            }
        }

        for address in reschedule {
            tracing::info!(
                address = %address.to_checksum(None),
                "subscriber anchor reorged away, re-initializing"
            );
            state.registry.requeue(address);
        }
    }
}
