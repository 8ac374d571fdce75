//! Optimistic reaction toggles end to end

use crate::common::{core, eventually};
use crate::{assert_err, assert_ok};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use xfsync::shared::error::{CoreError, TransportError};
use xfsync::shared::event::{ReactionEvent, ReactionMap};
use xfsync::transport::SyncResponse;

fn reactions(entries: &[(&str, &[&str])]) -> ReactionMap {
    entries
        .iter()
        .map(|(emoji, actors)| {
            (
                emoji.to_string(),
                actors.iter().map(|a| a.to_string()).collect::<BTreeSet<_>>(),
            )
        })
        .collect::<BTreeMap<_, _>>()
}

#[tokio::test]
async fn test_offline_toggle_commits_on_reconnect() {
    let mut core = core().await;
    assert_ok!(core.service.start());

    let toggle = assert_ok!(core.service.reactions().toggle_reaction("m1", "alice", "👍").await);
    assert!(toggle.added);
    assert_eq!(toggle.reactions, reactions(&[("👍", &["alice"])]));
    assert_err!(
        core.service.reactions().toggle_reaction("m1", "alice", "👍").await,
        CoreError::AlreadyPending { .. }
    );
    assert_eq!(core.service.queue().pending_count().await, 1);

    core.transport.connect();
    let service = &core.service;
    eventually("toggle to be confirmed", || async move {
        matches!(service.get_stats().await, Ok(stats) if stats.optimistic_pending == 0)
    })
    .await;
    assert_eq!(
        core.service.reactions().reactions("m1").await,
        reactions(&[("👍", &["alice"])])
    );

    let undo = assert_ok!(core.service.reactions().toggle_reaction("m1", "alice", "👍").await);
    assert!(!undo.added);
    assert!(undo.reactions.is_empty());
}

#[tokio::test]
async fn test_authoritative_response_replaces_local_view() {
    let mut core = core().await;
    assert_ok!(core.service.start());
    let mut reaction_events = core.service.events().reactions.subscribe();
    core.transport.push_outcome(Ok(SyncResponse {
        payload: json!({"reactions": {"👍": ["alice", "bob"]}, "revision": 5}),
        revision: Some(5),
    }));

    assert_ok!(core.service.reactions().toggle_reaction("m1", "alice", "👍").await);
    core.transport.connect();

    let service = &core.service;
    eventually("server reactions to land", || async move {
        service.reactions().reactions("m1").await == reactions(&[("👍", &["alice", "bob"])])
    })
    .await;

    let events = reaction_events.drain_buffered();
    assert!(matches!(events.first(), Some(ReactionEvent::Updated { added: true, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ReactionEvent::Reconciled { message_id, .. } if message_id == "m1")));
}

#[tokio::test]
async fn test_rejected_toggle_rolls_back() {
    let mut core = core().await;
    assert_ok!(core.service.start());
    core.service
        .reactions()
        .reconcile("m2", reactions(&[("🎉", &["carol"])]), Some(1))
        .await
        .unwrap();
    core.transport
        .push_outcome(Err(TransportError::Rejected("reactions disabled".into())));

    let toggle = assert_ok!(core.service.reactions().toggle_reaction("m2", "dave", "🎉").await);
    assert_eq!(toggle.reactions, reactions(&[("🎉", &["carol", "dave"])]));
    core.transport.connect();

    let service = &core.service;
    eventually("toggle to roll back", || async move {
        service.reactions().reactions("m2").await == reactions(&[("🎉", &["carol"])])
    })
    .await;
    assert_eq!(core.service.queue().get_failed().await.len(), 1);
}

#[tokio::test]
async fn test_push_overrides_pending_toggle() {
    let mut core = core().await;
    assert_ok!(core.service.start());
    assert_ok!(core.service.reactions().toggle_reaction("m3", "alice", "👍").await);

    core.transport.push(
        "reactions_updated",
        json!({"message_id": "m3", "reactions": {"🎉": ["carol"]}, "revision": 2}),
    );
    let service = &core.service;
    eventually("push to reconcile", || async move {
        service.reactions().reactions("m3").await == reactions(&[("🎉", &["carol"])])
    })
    .await;

    core.transport.connect();
    eventually("queue to empty", || async move {
        service.queue().pending_count().await == 0
    })
    .await;
    assert_eq!(
        core.service.reactions().reactions("m3").await,
        reactions(&[("🎉", &["carol"])])
    );
}

#[tokio::test]
async fn test_stale_push_is_ignored() {
    let mut core = core().await;
    assert_ok!(core.service.start());
    let mut reaction_events = core.service.events().reactions.subscribe();

    core.transport.push(
        "reactions_updated",
        json!({"message_id": "m4", "reactions": {"🔥": ["erin"]}, "revision": 5}),
    );
    core.transport.push(
        "reactions_updated",
        json!({"message_id": "m4", "reactions": {"👎": ["frank"]}, "revision": 3}),
    );
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), reaction_events.recv()).await;
        assert!(matches!(event, Ok(Some(ReactionEvent::Reconciled { .. }))));
    }
    assert_eq!(
        core.service.reactions().reactions("m4").await,
        reactions(&[("🔥", &["erin"])])
    );
}
