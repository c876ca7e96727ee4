use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use tokio::time::sleep;

use argus::common::BlockInfo;
use argus::engine::{BlockEngine, EngineOptions};
use argus::ingest::{HeaderPoller, IngestQueue};
use argus::provider::MockProvider;

fn block(number: u64, hash: u8, parent: u8) -> BlockInfo {
    BlockInfo {
        number,
        hash: B256::repeat_byte(hash),
        parent_hash: B256::repeat_byte(parent),
    }
}

fn canon(number: u64) -> BlockInfo {
    block(number, number as u8, number.wrapping_sub(1) as u8)
}

fn canon_chain(from: u64, to: u64) -> Vec<BlockInfo> {
    (from..=to).map(canon).collect()
}

fn options() -> EngineOptions {
    EngineOptions {
        max_block_cached: 16,
        batch_size: 16,
        max_retry_get_block: 2,
        retry_delay_get_block_ms: 1,
        max_retry_get_logs: 2,
        retry_delay_get_logs_ms: 1,
        get_logs_timeout_ms: 1_000,
        batch_chunk_delay_ms: 0,
    }
}

async fn wait_for_head(engine: &BlockEngine<MockProvider>, number: u64) -> bool {
    for _ in 0..200 {
        if engine.head().await.map(|head| head.number) == Some(number) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_drains_headers_in_order() {
    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 103));

    let engine = Arc::new(BlockEngine::new(Arc::clone(&provider), options()).unwrap());
    engine.initialize(canon(100).as_ref()).await;
    let queue = IngestQueue::new(Arc::clone(&engine));

    for number in 101..=103 {
        queue.push(canon(number));
    }

    assert!(wait_for_head(&engine, 103).await);
    assert!(queue.is_empty());
    assert_eq!(engine.head().await.unwrap(), canon(103));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_handles_headers_pushed_mid_drain() {
    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 110));

    let engine = Arc::new(BlockEngine::new(Arc::clone(&provider), options()).unwrap());
    engine.initialize(canon(100).as_ref()).await;
    let queue = IngestQueue::new(Arc::clone(&engine));

    queue.push(canon(101));
    // Late arrivals join the same drain pass.
    for number in 102..=110 {
        queue.push(canon(number));
        sleep(Duration::from_millis(1)).await;
    }

    assert!(wait_for_head(&engine, 110).await);
    assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poller_anchors_follows_and_stops() {
    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 100));

    let engine = Arc::new(BlockEngine::new(Arc::clone(&provider), options()).unwrap());
    let queue = IngestQueue::new(Arc::clone(&engine));
    let mut poller = HeaderPoller::new(
        Arc::clone(&provider),
        Arc::clone(&queue),
        Duration::from_millis(10),
    );

    poller.start().await.unwrap();
    assert_eq!(engine.head().await.unwrap().number, 100);

    provider.push_block(canon(101));
    assert!(wait_for_head(&engine, 101).await);

    poller.stop();
    sleep(Duration::from_millis(30)).await;
    provider.push_block(canon(102));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.head().await.unwrap().number, 101);
}
