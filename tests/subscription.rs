use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Result;

use argus::common::{BlockInfo, BlockRef, EventLog};
use argus::engine::{BlockEngine, EngineOptions};
use argus::provider::MockProvider;
use argus::subscription::{AddressAndTopics, LogSubscriber, StateHandler, StateSubscriber};

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

fn fork(number: u64, parent_forked: bool) -> BlockInfo {
    let parent = number.wrapping_sub(1) as u8;
    block(
        number,
        number as u8 | 0x80,
        if parent_forked { parent | 0x80 } else { parent },
    )
}

fn log_for(address: Address, block: &BlockInfo, log_index: u64) -> EventLog {
    EventLog {
        block_number: block.number,
        block_hash: block.hash,
        log_index,
        address,
        ..Default::default()
    }
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

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Initialized(u64),
    Log(u64, u64),
    Rollback(u64),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSubscriber for Recorder {
    async fn initialize(&self, anchor: BlockRef) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Initialized(anchor.number));
        Ok(())
    }

    async fn handle_log(&self, log: &EventLog) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Log(log.block_number, log.log_index));
    }

    fn rollback(&self, block: BlockRef) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Rollback(block.number));
    }
}

#[tokio::test]
async fn test_subscriber_anchored_above_fork_is_reinitialized() {
    let addr_a = Address::repeat_byte(0xaa);
    let addr_b = Address::repeat_byte(0xbb);

    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 105));
    provider.set_logs(vec![log_for(addr_a, &canon(101), 0)]);

    let engine = BlockEngine::new(Arc::clone(&provider), options()).unwrap();
    let early = Arc::new(Recorder::default());
    engine
        .subscribe_to_logs(AddressAndTopics::new(addr_a), early.clone())
        .await;
    engine.initialize(canon(100).as_ref()).await;
    for number in 101..=105 {
        engine.handle_block(canon(number)).await.unwrap();
    }

    // This subscriber anchors at block 105, which the reorg below removes.
    let late = Arc::new(Recorder::default());
    engine
        .subscribe_to_logs(AddressAndTopics::new(addr_b), late.clone())
        .await;
    assert_eq!(late.events(), vec![Event::Initialized(105)]);

    let mut reorged = canon_chain(80, 100);
    reorged.push(fork(101, false));
    for number in 102..=106 {
        reorged.push(fork(number, true));
    }
    provider.set_chain(reorged);
    provider.set_logs(vec![log_for(addr_a, &fork(102, true), 0)]);

    let handled = engine.handle_block(fork(106, true)).await.unwrap();

    assert_eq!(handled.rollback, Some(canon(100).as_ref()));
    // The early subscriber saw an event above the ancestor: plain rollback.
    assert_eq!(
        early.events(),
        vec![
            Event::Initialized(100),
            Event::Log(101, 0),
            Event::Rollback(100),
            Event::Log(102, 0),
        ]
    );
    // The late subscriber's anchor was reorged away: fresh initialization at
    // the new head, no rollback.
    assert_eq!(
        late.events(),
        vec![Event::Initialized(105), Event::Initialized(106)]
    );
}

#[tokio::test]
async fn test_second_subscription_replaces_the_first() {
    let addr = Address::repeat_byte(0xaa);

    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 100));
    provider.push_block(canon(101));
    provider.set_logs(vec![log_for(addr, &canon(101), 0)]);

    let engine = BlockEngine::new(Arc::clone(&provider), options()).unwrap();
    engine.initialize(canon(100).as_ref()).await;

    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    engine
        .subscribe_to_logs(AddressAndTopics::new(addr), first.clone())
        .await;
    engine
        .subscribe_to_logs(AddressAndTopics::new(addr), second.clone())
        .await;

    engine.handle_block(canon(101)).await.unwrap();

    assert_eq!(first.events(), vec![Event::Initialized(100)]);
    assert_eq!(
        second.events(),
        vec![Event::Initialized(100), Event::Log(101, 0)]
    );
}

#[tokio::test]
async fn test_topic_filter_scopes_dispatch() {
    let addr = Address::repeat_byte(0xaa);
    let wanted = B256::repeat_byte(0x11);
    let other = B256::repeat_byte(0x22);

    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 101));
    provider.set_logs(vec![
        EventLog {
            topics: vec![wanted],
            ..log_for(addr, &canon(101), 0)
        },
        EventLog {
            topics: vec![other],
            ..log_for(addr, &canon(101), 1)
        },
        log_for(addr, &canon(101), 2),
    ]);

    let engine = BlockEngine::new(Arc::clone(&provider), options()).unwrap();
    let recorder = Arc::new(Recorder::default());
    engine
        .subscribe_to_logs(
            AddressAndTopics {
                address: addr,
                topics: vec![wanted],
            },
            recorder.clone(),
        )
        .await;
    engine.initialize(canon(100).as_ref()).await;

    engine.handle_block(canon(101)).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![Event::Initialized(100), Event::Log(101, 0)]
    );
}

struct Counting;

#[async_trait]
impl StateHandler for Counting {
    type State = u64;

    async fn state_initialize(&self, _anchor: BlockRef) -> Result<u64> {
        Ok(0)
    }

    fn state_handle_log(&self, state: u64, _log: &EventLog) -> u64 {
        state + 1
    }
}

#[tokio::test]
async fn test_stateful_subscriber_survives_a_reorg() {
    let addr = Address::repeat_byte(0xaa);

    let provider = Arc::new(MockProvider::new());
    provider.set_chain(canon_chain(80, 102));
    provider.set_logs(vec![
        log_for(addr, &canon(101), 0),
        log_for(addr, &canon(101), 1),
        log_for(addr, &canon(102), 0),
    ]);

    let engine = BlockEngine::new(Arc::clone(&provider), options()).unwrap();
    let counting = Arc::new(StateSubscriber::new(Counting));
    engine
        .subscribe_to_logs(AddressAndTopics::new(addr), counting.clone())
        .await;
    engine.initialize(canon(99).as_ref()).await;

    engine.handle_block(canon(100)).await.unwrap();
    engine.handle_block(canon(101)).await.unwrap();
    engine.handle_block(canon(102)).await.unwrap();

    assert_eq!(counting.state_at(101), Some(2));
    assert_eq!(counting.current_state(), Some(3));

    // Blocks 101 and 102 are replaced; each fork block carries one event.
    let mut reorged = canon_chain(80, 100);
    reorged.push(fork(101, false));
    reorged.push(fork(102, true));
    provider.set_chain(reorged);
    provider.set_logs(vec![
        log_for(addr, &fork(101, false), 0),
        log_for(addr, &fork(102, true), 0),
    ]);

    engine.handle_block(fork(102, true)).await.unwrap();

    assert_eq!(counting.state_at(101), Some(1));
    assert_eq!(counting.current_state(), Some(2));
    assert_eq!(
        counting.last_seen(),
        Some(fork(102, true).as_ref())
    );
}
