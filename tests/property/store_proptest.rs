//! Property-based tests for the local store

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use xfsync::local_db::{LocalStore, MemoryBackend, StoredValue, Ttl};
use xfsync::test_utils::ManualClock;

fn store_with_clock() -> (LocalStore, ManualClock) {
    let clock = ManualClock::default();
    let store = LocalStore::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(clock.clone()),
        Duration::from_secs(3600),
    );
    (store, clock)
}

proptest! {
    #[test]
    fn test_bytes_read_back_unchanged(key in "[a-z:/]{1,24}", bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        tokio_test::block_on(async {
            let (store, _) = store_with_clock();
            store.store(&key, bytes.clone(), Ttl::Never).await.unwrap();
            let value = store.get(&key).await.unwrap();
            prop_assert_eq!(value, Some(StoredValue::Bytes(bytes)));
            Ok(())
        })?;
    }

    #[test]
    fn test_entry_readable_only_before_expiry(ttl_secs in 1u64..10_000, elapsed_secs in 0u64..20_000) {
        tokio_test::block_on(async {
            let (store, clock) = store_with_clock();
            store
                .store("k", serde_json::json!(ttl_secs), Ttl::After(Duration::from_secs(ttl_secs)))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(elapsed_secs));

            let found = store.get("k").await.unwrap().is_some();
            prop_assert_eq!(found, elapsed_secs < ttl_secs);
            Ok(())
        })?;
    }
}
