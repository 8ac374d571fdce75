//! Property-based tests for the durable sync queue
//!
//! Reopening a queue over the same store must restore exactly what was
//! enqueued, in order, and delivery must keep per-entity FIFO.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use xfsync::local_db::LocalStore;
use xfsync::offline::{NewOperation, SyncQueue};
use xfsync::shared::config::{ConnectivityConfig, SyncConfig};
use xfsync::shared::event::CoreEvents;
use xfsync::sync::ConnectivityMonitor;
use xfsync::test_utils::FakeTransport;

async fn open_queue(store: &LocalStore, transport: Arc<FakeTransport>) -> (SyncQueue, Arc<ConnectivityMonitor>) {
    let events = CoreEvents::default();
    let monitor = Arc::new(ConnectivityMonitor::new(
        ConnectivityConfig::default(),
        store.clock().clone(),
        events.state.clone(),
    ));
    let queue = SyncQueue::open(
        store.clone(),
        transport,
        monitor.clone(),
        events.sync.clone(),
        &SyncConfig::default(),
    )
    .await
    .unwrap();
    (queue, monitor)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_restart_preserves_order_and_entity_fifo(
        writes in prop::collection::vec((0usize..3, any::<i32>()), 1..20),
    ) {
        tokio_test::block_on(async {
            let store = LocalStore::in_memory();
            let transport = Arc::new(FakeTransport::new());

            let mut enqueued = Vec::new();
            {
                let (queue, _) = open_queue(&store, transport.clone()).await;
                for (entity, value) in &writes {
                    let op = NewOperation::update(format!("doc:{}", entity), json!(value));
                    enqueued.push(queue.enqueue(op).await.unwrap());
                }
            }

            let (queue, monitor) = open_queue(&store, transport.clone()).await;
            let restored: Vec<_> = queue.get_pending().await.iter().map(|op| op.id).collect();
            prop_assert_eq!(&restored, &enqueued);

            monitor.handle_connected();
            let report = queue.drain().await;
            prop_assert_eq!(report.delivered, writes.len());

            let sent = transport.sent();
            for entity in 0..3 {
                let key = format!("doc:{}", entity);
                let expected: Vec<_> = writes
                    .iter()
                    .filter(|(e, _)| *e == entity)
                    .map(|(_, v)| json!(v))
                    .collect();
                let delivered: Vec<_> = sent
                    .iter()
                    .filter(|r| r.entity_key == key)
                    .map(|r| r.payload.clone())
                    .collect();
                prop_assert_eq!(delivered, expected);
            }
            prop_assert_eq!(queue.pending_count().await, 0);
            Ok(())
        })?;
    }
}
