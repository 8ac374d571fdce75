//! Property-based tests for optimistic state

use proptest::prelude::*;
use serde_json::{json, Value};
use xfsync::offline::{OptimisticEngine, ServerState};

proptest! {
    #[test]
    fn test_duplicate_mutation_applies_once(attempts in 2usize..8, start in any::<i64>()) {
        tokio_test::block_on(async {
            let engine = OptimisticEngine::new();
            engine.seed("counter", json!(start), None).await;

            let mut accepted = 0;
            for _ in 0..attempts {
                let applied = engine
                    .apply_optimistic("counter", "alice", "increment", |v: &Value| {
                        json!(v.as_i64().unwrap_or(0).wrapping_add(1))
                    })
                    .await;
                if applied.is_ok() {
                    accepted += 1;
                }
            }
            prop_assert_eq!(accepted, 1);
            prop_assert_eq!(engine.pending_count().await, 1);
            prop_assert_eq!(engine.local_version("counter").await, Some(json!(start.wrapping_add(1))));
            Ok(())
        })?;
    }

    #[test]
    fn test_reconcile_is_idempotent(text in ".*", revision in 0u64..1000, pending in 0usize..4) {
        tokio_test::block_on(async {
            let engine = OptimisticEngine::new();
            for n in 0..pending {
                let kind = format!("edit:{}", n);
                engine
                    .apply_optimistic("doc", "bob", &kind, move |_: &Value| json!({ "draft": n }))
                    .await
                    .unwrap();
            }

            let server = json!({ "text": text });
            let first = engine.reconcile("doc", ServerState::new(server.clone(), Some(revision))).await;
            let second = engine.reconcile("doc", ServerState::new(server.clone(), Some(revision))).await;
            prop_assert_eq!(&first, &server);
            prop_assert_eq!(&second, &first);
            prop_assert_eq!(engine.pending_count().await, 0);
            Ok(())
        })?;
    }

    #[test]
    fn test_older_revision_never_wins(newer in 1u64..1000, lag in 1u64..1000) {
        tokio_test::block_on(async {
            let engine = OptimisticEngine::new();
            let older = newer.saturating_sub(lag);
            prop_assume!(older < newer);

            engine.reconcile("doc", ServerState::new(json!("current"), Some(newer))).await;
            let local = engine.reconcile("doc", ServerState::new(json!("stale"), Some(older))).await;
            prop_assert_eq!(local, json!("current"));
            Ok(())
        })?;
    }

    #[test]
    fn test_reject_restores_committed_value(base in any::<i32>(), edits in 1usize..5) {
        tokio_test::block_on(async {
            let engine = OptimisticEngine::new();
            engine.seed("n", json!(base), Some(1)).await;

            let mut keys = Vec::new();
            for n in 0..edits {
                let kind = format!("set:{}", n);
                keys.push(
                    engine
                        .apply_optimistic("n", "carol", &kind, move |_: &Value| json!(n))
                        .await
                        .unwrap(),
                );
            }
            for key in &keys {
                engine.reject(key).await;
            }
            prop_assert_eq!(engine.local_version("n").await, Some(json!(base)));
            Ok(())
        })?;
    }
}
