//! Restart survival on the SQLite store

use crate::common::sqlite_service;
use crate::assert_ok;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use xfsync::local_db::Ttl;
use xfsync::offline::{FailureReason, NewOperation, OperationStatus};
use xfsync::shared::error::{ConflictReason, TransportError};
use xfsync::test_utils::FakeTransport;

#[tokio::test]
async fn test_pending_operations_survive_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.db");
    let transport = Arc::new(FakeTransport::new());

    let first_ids = {
        let service = sqlite_service(&path, transport.clone()).await;
        let mut ids = Vec::new();
        for (entity, n) in [("msg:a", 1), ("msg:b", 2), ("msg:a", 3)] {
            ids.push(assert_ok!(
                service
                    .queue_for_sync(NewOperation::update(entity, json!({ "n": n })))
                    .await
            ));
        }
        ids
    };

    let service = sqlite_service(&path, transport.clone()).await;
    let restored: Vec<_> = service.queue().get_pending().await.iter().map(|op| op.id).collect();
    assert_eq!(restored, first_ids);

    service.monitor().handle_connected();
    let report = service.sync_pending_data().await;
    assert_eq!(report.delivered, 3);
    let sent: Vec<_> = transport.sent().into_iter().map(|r| r.operation_id).collect();
    assert_eq!(sent, first_ids);
}

#[tokio::test]
async fn test_dead_letters_survive_restart_until_dismissed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.db");
    let transport = Arc::new(FakeTransport::new());

    let id = {
        let service = sqlite_service(&path, transport.clone()).await;
        transport.push_outcome(Err(TransportError::Conflict(
            ConflictReason::ConcurrentModification {
                server_revision: Some(9),
            },
        )));
        let id = assert_ok!(service.queue_for_sync(NewOperation::delete("msg:gone")).await);
        service.monitor().handle_connected();
        assert_eq!(service.sync_pending_data().await.failed, 1);
        id
    };

    let service = sqlite_service(&path, transport.clone()).await;
    let failed = service.queue().get_failed().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].status, OperationStatus::Failed);
    assert!(matches!(failed[0].failure, Some(FailureReason::Conflict(_))));

    assert_ok!(service.queue().dismiss_failed(id).await);
    drop(service);
    let service = sqlite_service(&path, transport).await;
    assert!(service.queue().get_failed().await.is_empty());
}

#[tokio::test]
async fn test_local_data_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.db");
    let transport = Arc::new(FakeTransport::new());

    {
        let service = sqlite_service(&path, transport.clone()).await;
        assert_ok!(
            service
                .store_local_data("draft:1", json!({"text": "unsent"}), Ttl::Never)
                .await
        );
    }

    let service = sqlite_service(&path, transport).await;
    let value = assert_ok!(service.get_local_data("draft:1").await).unwrap();
    assert_eq!(value.as_json(), Some(&json!({"text": "unsent"})));
    assert!(assert_ok!(service.get_stats().await).data_stored_locally.entries >= 1);
}
