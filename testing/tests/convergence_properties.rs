//! Property tests: whatever order and multiplicity the broker delivers a
//! write workload in, the read model ends up mirroring the authoritative
//! record, and no document ever moves backwards in time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration as ChronoDuration;
use gavel_core::auction::{AuctionId, AuctionStore};
use gavel_core::event::SerializedEvent;
use gavel_core::routing::TopicRouter;
use gavel_projections::{ConsumerConfig, ConsumerWorker, SearchIndexer};
use gavel_runtime::{DispatcherConfig, OutboxDispatcher, RetryPolicy};
use gavel_testing::properties::{WriteOp, arb_workload};
use gavel_testing::{
    InMemoryAuctionStore, InMemoryEventBus, InMemoryPoisonStore, InMemorySearchStore, fixtures,
};
use proptest::prelude::*;
use proptest::sample::Index;
use std::sync::Arc;

/// Run `ops` against a fresh auction and return what the broker received.
async fn publish_workload(ops: &[WriteOp]) -> (InMemoryAuctionStore, AuctionId, Vec<SerializedEvent>) {
    let clock = fixtures::manual_clock();
    let auctions = InMemoryAuctionStore::new(clock.clone());
    let bus = InMemoryEventBus::new();
    let dispatcher = OutboxDispatcher::new(
        Arc::new(auctions.clone()),
        Arc::new(bus.clone()),
        TopicRouter::default(),
        DispatcherConfig::default(),
    )
    .unwrap();

    let record = auctions.create(fixtures::new_toyota()).await.unwrap();
    for op in ops {
        match op {
            WriteOp::Update { advance_ms, patch } => {
                clock.advance(ChronoDuration::milliseconds(*advance_ms));
                auctions.update(record.id, patch.clone()).await.unwrap();
            }
            WriteOp::Delete { advance_ms } => {
                clock.advance(ChronoDuration::milliseconds(*advance_ms));
                auctions.delete(record.id).await.unwrap();
            }
        }
    }
    while dispatcher.dispatch_batch().await.unwrap().published > 0 {}

    let published = bus.published().into_iter().map(|(_, event)| event).collect();
    (auctions, record.id, published)
}

/// Reorder by `keys` and append the duplicates picked by `duplicates`.
fn scramble(
    messages: Vec<SerializedEvent>,
    keys: &[u32],
    duplicates: &[Index],
) -> Vec<SerializedEvent> {
    let mut order: Vec<usize> = (0..messages.len()).collect();
    order.sort_by_key(|i| (keys[i % keys.len()], *i));
    let mut delivery: Vec<_> = order.into_iter().map(|i| messages[i].clone()).collect();
    for pick in duplicates {
        delivery.push(messages[pick.index(messages.len())].clone());
    }
    delivery
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    #[test]
    fn any_delivery_order_converges(
        ops in arb_workload(),
        keys in prop::collection::vec(any::<u32>(), 1..16),
        duplicates in prop::collection::vec(any::<Index>(), 0..6),
    ) {
        runtime().block_on(async {
            let (auctions, id, published) = publish_workload(&ops).await;
            let search = InMemorySearchStore::new();
            let poison = InMemoryPoisonStore::new();
            let indexer = Arc::new(SearchIndexer::new(Arc::new(search.clone())));
            let consumer = ConsumerWorker::new(
                Arc::clone(&indexer),
                Arc::new(InMemoryEventBus::new()),
                Arc::new(poison.clone()),
                TopicRouter::default(),
                ConsumerConfig::builder().retry(RetryPolicy::no_retry()).build(),
            );

            let mut high_water = None;
            for message in scramble(published, &keys, &duplicates) {
                consumer.handle(&message).await.unwrap();
                let applied = search.snapshot().get(&id).map(|entry| entry.last_applied_at());
                prop_assert!(applied >= high_water, "apply timestamp moved backwards");
                high_water = applied;
            }

            prop_assert!(poison.is_empty());
            match auctions.get(id).await.unwrap() {
                Some(record) => {
                    let doc = search.document(id).expect("live auction missing from search");
                    prop_assert!(doc.mirrors(&record));
                }
                None => {
                    prop_assert!(search.document(id).is_none());
                    prop_assert!(search.is_tombstoned(id));
                }
            }
            Ok(())
        })?;
    }
}
