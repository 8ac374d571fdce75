//! End-to-end behavior of the core under connectivity changes

use crate::common::{core, core_with, eventually};
use crate::{assert_err, assert_ok};
use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use xfsync::loader::{LoadRequest, Priority};
use xfsync::offline::NewOperation;
use xfsync::shared::config::CoreConfig;
use xfsync::shared::error::{CoreError, TransportError};
use xfsync::shared::event::SyncEvent;
use xfsync::sync::ConnectivityState;

#[tokio::test]
async fn test_offline_operations_replay_in_order_on_reconnect() {
    let mut core = core().await;
    let mut states = core.service.events().state.subscribe();

    for n in 0..3 {
        assert_ok!(
            core.service
                .queue_for_sync(NewOperation::update("msg:1", json!({ "n": n })))
                .await
        );
    }
    assert_eq!(core.service.monitor().state(), ConnectivityState::Offline);
    assert!(core.transport.sent().is_empty());

    assert_ok!(core.service.start());
    core.transport.connect();

    let service = &core.service;
    eventually("drain to finish", || async move {
        service.queue().drain_metrics().completed_drains >= 1
    })
    .await;

    let payloads: Vec<_> = core.transport.sent().into_iter().map(|r| r.payload).collect();
    assert_eq!(payloads, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);

    let transitions: Vec<_> = states.drain_buffered().into_iter().map(|e| e.current).collect();
    assert_eq!(
        transitions,
        vec![ConnectivityState::Syncing, ConnectivityState::Online]
    );

    let stats = assert_ok!(core.service.get_stats().await);
    assert_eq!(stats.sync_operations.pending, 0);
    assert_eq!(stats.sync_operations.completed_total, 3);
    assert!(stats.last_sync_time.is_some());
}

#[tokio::test]
async fn test_duplicate_add_item_fetches_once() {
    let core = core().await;
    core.service.monitor().handle_connected();
    core.fetcher.set_delay("photo:9", Duration::from_millis(50));

    let request = LoadRequest::new("photo:9", "https://cdn.test/photo/9.jpg");
    let high = core.service.add_item(request.clone(), Priority::High).await;
    let low = core.service.add_item(request, Priority::Low).await;

    let (high, low) = tokio::join!(high, low);
    let (high, low) = (assert_ok!(high), assert_ok!(low));
    assert_eq!(high.data, low.data);
    assert!(!high.from_cache);
    assert_eq!(core.fetcher.fetch_count(), 1);
    assert!(core.service.is_item_loaded("photo:9"));
    assert_eq!(
        assert_ok!(core.service.get_item_data("photo:9").await),
        Some(high.data)
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_exponentially() {
    let core = core().await;
    let mut sync_events = core.service.events().sync.subscribe();
    for _ in 0..3 {
        core.transport
            .push_outcome(Err(TransportError::Transient("503 service unavailable".into())));
    }
    let id = assert_ok!(
        core.service
            .queue_for_sync(NewOperation::create("msg:7", json!({"text": "hello"})))
            .await
    );
    core.service.monitor().handle_connected();

    let report = core.service.sync_pending_data().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);

    let sent_at = core.transport.sent_at();
    assert_eq!(sent_at.len(), 4);
    let gaps: Vec<Duration> = sent_at.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    let events = sync_events.drain_buffered();
    let delays: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Retrying { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000]);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Completed { operation_id, .. } if *operation_id == id)));
    assert_eq!(core.service.monitor().state(), ConnectivityState::Online);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let config = assert_ok!(CoreConfig::builder()
        .max_concurrent(2)
        .adaptive_loading(false)
        .build());
    let core = core_with(config).await;
    core.service.monitor().handle_connected();
    core.fetcher.set_default_delay(Duration::from_millis(30));

    let mut handles = Vec::new();
    for n in 0..5 {
        let request = LoadRequest::new(format!("page:{}", n), format!("https://api.test/page/{}", n));
        handles.push(core.service.add_item(request, Priority::Medium).await);
    }
    let stats = core.service.loader().stats();
    assert_eq!(stats.in_flight, 2);
    assert_eq!(stats.queued, 3);

    for outcome in join_all(handles).await {
        assert_ok!(outcome);
    }
    assert_eq!(core.fetcher.peak_concurrency(), 2);
    assert_eq!(core.fetcher.fetch_count(), 5);
    assert_eq!(core.service.loader().stats().in_flight, 0);
}

#[tokio::test]
async fn test_disconnect_pauses_drain_and_reconnect_resumes() {
    let mut core = core().await;
    assert_ok!(core.service.start());
    core.transport.set_send_delay(Duration::from_millis(20));
    for n in 0..4 {
        assert_ok!(
            core.service
                .queue_for_sync(NewOperation::update(format!("doc:{}", n), json!(n)))
                .await
        );
    }

    let service = &core.service;
    let transport = core.transport.clone();
    core.transport.set_on_send(move |request| {
        if request.payload == json!(1) && request.attempt == 1 {
            transport.disconnect();
        }
    });
    core.transport.connect();

    eventually("drain to pause", || async move {
        service.monitor().state() == ConnectivityState::Offline
            && service.queue().drain_metrics().paused_drains >= 1
    })
    .await;
    assert!(service.queue().pending_count().await > 0);

    core.transport.connect();
    eventually("queue to empty", || async move {
        service.queue().pending_count().await == 0
    })
    .await;

    let stats = assert_ok!(service.get_stats().await);
    assert_eq!(stats.sync_operations.completed_total, 4);
    assert_eq!(stats.sync_operations.failed, 0);
}

#[tokio::test]
async fn test_quota_exceeded_rejects_enqueue() {
    let config = assert_ok!(CoreConfig::builder().capacity_bytes(256).build());
    let core = core_with(config).await;

    let big = json!({ "text": "x".repeat(1024) });
    assert_err!(
        core.service.queue_for_sync(NewOperation::create("msg:1", big)).await,
        CoreError::QuotaExceeded { .. }
    );
    assert_eq!(core.service.queue().pending_count().await, 0);
}
