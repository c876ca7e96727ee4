//! Log fetching with block-hash verification.

use std::collections::HashMap;

use tokio::time::{sleep, timeout};

use crate::common::{BlockInfo, BlockRef, EventLog};
use crate::provider::{ChainProvider, ProviderError};

use super::{deepest, reorg::ReorgOutcome, BlockEngine, EngineError, EngineState};

/// Error fragments nodes return while they are themselves mid-reorg; these
/// are expected and retried without a warning.
const EXPECTED_GET_LOGS_ERRORS: [&str; 2] = ["not processed yet", "cannot be found"];

/// The result of a verified log query.
#[derive(Debug, Clone)]
pub(crate) struct LogQuery {
    /// Logs for the queried range, ascending `(block_number, log_index)`.
    pub(crate) logs: Vec<EventLog>,
    /// The deepest common ancestor established while the query ran, seeded
    /// by the caller when a reorg was already being repaired. Subscribers
    /// must be rolled back this far.
    pub(crate) common_ancestor: Option<BlockInfo>,
}

/// Outcome of [BlockEngine::query_logs].
#[derive(Debug, Clone)]
pub(crate) enum QueryOutcome {
    /// The query completed against a consistent chain view.
    Logs(LogQuery),
    /// A fork discovered mid-query was deeper than the cache; the engine
    /// re-anchored and the query was abandoned.
    ReAnchored(BlockRef),
}

impl<P: ChainProvider> BlockEngine<P> {
    /// Fetches the logs in `(from.number, to.number]` for the subscribed
    /// address set and verifies each log against the cached chain (or the
    /// supplied gap-fill chunk).
    ///
    /// A block-hash mismatch means the chain forked while the query was in
    /// flight: the reorg is resolved, the cache re-chained up to `to`, and
    /// the query retried from the common ancestor. The ancestor eventually
    /// returned is the deepest one established along the way.
    pub(crate) async fn query_logs(
        &self,
        state: &mut EngineState,
        from: BlockInfo,
        to: BlockInfo,
        seed_ancestor: Option<BlockInfo>,
        chunk: Option<&HashMap<u64, BlockInfo>>,
    ) -> Result<QueryOutcome, EngineError> {
        let mut common_ancestor = seed_ancestor;
        let mut from = from;
        let mut attempt = 0;

        loop {
            let addresses = state.registry.addresses();
            if addresses.is_empty() || from.number >= to.number {
                return Ok(QueryOutcome::Logs(LogQuery {
                    logs: Vec::new(),
                    common_ancestor,
                }));
            }

            let request = self
                .provider
                .get_logs(from.number + 1, to.number, &addresses);
            let result = match timeout(self.options.get_logs_timeout(), request).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Rpc(format!(
                    "get_logs timed out after {:?}",
                    self.options.get_logs_timeout()
                ))),
            };

            let logs = match result {
                Ok(logs) => logs,
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.max_retry_get_logs {
                        return Err(EngineError::MaxRetryReached);
                    }
                    let message = err.to_string();
                    if is_expected_during_reorg(&message) {
                        tracing::debug!(%message, attempt, "get_logs failed mid-reorg, retrying");
                    } else {
                        tracing::warn!(%message, attempt, "get_logs failed, retrying");
                    }
                    sleep(self.options.retry_delay_get_logs()).await;
                    continue;
                }
            };

            // Verify every log against the block we believe is canonical.
            let mut forked_at = None;
            for log in &logs {
                let known = state
                    .cache
                    .get(log.block_number)
                    .copied()
                    .or_else(|| chunk.and_then(|blocks| blocks.get(&log.block_number)).copied());

                match known {
                    None => {
                        return Err(EngineError::FailedFetchingLog(format!(
                            "log references block {} outside the cached chain",
                            log.block_number
                        )))
                    }
                    Some(block) if block.hash != log.block_hash => {
                        forked_at = Some(log.block_number);
                        break;
                    }
                    Some(_) => {}
                }
            }

            let Some(number) = forked_at else {
                return Ok(QueryOutcome::Logs(LogQuery {
                    logs,
                    common_ancestor,
                }));
            };

            tracing::warn!(number, "log query revealed a fork, resolving");
            match self.resolve_reorg(&mut state.cache, &to).await? {
                ReorgOutcome::ReAnchored(anchor) => {
                    return Ok(QueryOutcome::ReAnchored(anchor));
                }
                ReorgOutcome::Ancestor(ancestor) => {
                    let ancestor = deepest(common_ancestor, ancestor);
                    common_ancestor = Some(ancestor);
                    from = ancestor;

                    attempt += 1;
                    if attempt > self.options.max_retry_get_logs {
                        return Err(EngineError::MaxRetryReached);
                    }
                }
            }
        }
    }
}

fn is_expected_during_reorg(message: &str) -> bool {
    EXPECTED_GET_LOGS_ERRORS
        .iter()
        .any(|expected| message.contains(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorg_transients_are_recognized() {
        assert!(is_expected_during_reorg(
            "rpc error: block 12 not processed yet"
        ));
        assert!(is_expected_during_reorg("header cannot be found"));
        assert!(!is_expected_during_reorg("connection refused"));
    }
}
