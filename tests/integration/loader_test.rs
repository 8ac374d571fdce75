//! Progressive loader through the service

use crate::common::{core, core_with};
use crate::{assert_err, assert_ok};
use assert_matches::assert_matches;
use std::time::Duration;
use xfsync::loader::{LoadRequest, LoadState, LoaderLimits, Priority};
use xfsync::shared::config::CoreConfig;
use xfsync::shared::error::CoreError;
use xfsync::sync::NetworkQuality;

fn request(id: &str) -> LoadRequest {
    LoadRequest::new(id, format!("https://cdn.test/{}", id))
}

#[tokio::test]
async fn test_cancel_all_keeps_loaded_items_cached() {
    let core = core().await;
    core.service.monitor().handle_connected();

    assert_ok!(core.service.add_item(request("emoji:set"), Priority::Low).await.await);
    core.service.loader().cancel_all();

    let again = assert_ok!(core.service.add_item(request("emoji:set"), Priority::Low).await.await);
    assert!(again.from_cache);
    assert_eq!(core.fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_cache_entry_expires_with_ttl() {
    let core = core().await;
    core.service.monitor().handle_connected();

    assert_ok!(core.service.add_item(request("page:1"), Priority::Medium).await.await);
    core.clock.advance(Duration::from_secs(CoreConfig::default().loader.cache_ttl_secs + 1));

    assert_eq!(assert_ok!(core.service.get_item_data("page:1").await), None);
    let refetched = assert_ok!(core.service.add_item(request("page:1"), Priority::Medium).await.await);
    assert!(!refetched.from_cache);
    assert_eq!(core.fetcher.fetch_count(), 2);
}

#[tokio::test]
async fn test_failure_does_not_block_other_items() {
    let core = core().await;
    core.service.monitor().handle_connected();
    core.fetcher
        .set_result("broken", Err(CoreError::not_found("https://cdn.test/broken")));

    let broken = core.service.add_item(request("broken"), Priority::High).await;
    let fine = core.service.add_item(request("fine"), Priority::High).await;

    assert_err!(broken.await, CoreError::NotFound { .. });
    assert_ok!(fine.await);
    assert_eq!(core.service.loader().state("broken"), Some(LoadState::Failed));
    assert!(core.service.is_item_loaded("fine"));
    assert_eq!(core.service.loader().stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_network_scales_admissions() {
    let config = assert_ok!(CoreConfig::builder().max_concurrent(4).build());
    let core = core_with(config).await;
    let monitor = core.service.monitor();
    monitor.handle_connected();
    for _ in 0..10 {
        monitor.record_rtt(Duration::from_secs(2));
    }
    assert_eq!(monitor.quality(), NetworkQuality::Slow);
    assert_eq!(core.service.loader().effective_limits().max_concurrent, 2);

    core.fetcher.set_default_delay(Duration::from_millis(100));
    let mut handles = Vec::new();
    for n in 0..6 {
        handles.push(
            core.service
                .add_item(request(&format!("thumb:{}", n)), Priority::Medium)
                .await,
        );
    }
    for handle in handles {
        assert_ok!(handle.await);
    }
    assert_eq!(core.fetcher.peak_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_limits_admits_more() {
    let config = assert_ok!(CoreConfig::builder()
        .max_concurrent(1)
        .adaptive_loading(false)
        .build());
    let core = core_with(config).await;
    core.service.monitor().handle_connected();
    core.fetcher.set_default_delay(Duration::from_secs(1));

    let mut handles = Vec::new();
    for n in 0..3 {
        handles.push(
            core.service
                .add_item(request(&format!("a:{}", n)), Priority::Medium)
                .await,
        );
    }
    assert_eq!(core.service.loader().stats().in_flight, 1);

    core.service.loader().update_limits(LoaderLimits {
        max_concurrent: 3,
        timeout: Duration::from_secs(15),
        adaptive_loading: false,
    });
    assert_eq!(core.service.loader().stats().in_flight, 3);
    for handle in handles {
        assert_ok!(handle.await);
    }
}

#[tokio::test]
async fn test_cancel_all_resolves_pending_handles() {
    let core = core().await;
    core.service.monitor().handle_connected();
    core.fetcher.set_default_delay(Duration::from_secs(60));

    let handle = core.service.add_item(request("big"), Priority::Critical).await;
    assert!(core.service.is_item_loading("big"));
    assert_eq!(core.service.loader().cancel_all(), 1);
    assert_matches!(handle.await, Err(CoreError::Cancelled));
    assert!(!core.service.is_item_loading("big"));
}
