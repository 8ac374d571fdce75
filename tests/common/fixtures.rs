//! Core fixtures
//!
//! Builds a full `SyncService` over scripted collaborators so tests can drive
//! connectivity, delivery outcomes and fetch timing by hand.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use xfsync::local_db::{LocalStore, MemoryBackend};
use xfsync::shared::config::{CoreConfig, StoreConfig};
use xfsync::shared::error::TransportError;
use xfsync::sync::SyncService;
use xfsync::test_utils::{FakeTransport, ManualClock, ScriptedFetcher};

/// A service plus handles on everything it talks to
pub struct Core {
    pub service: SyncService,
    pub transport: Arc<FakeTransport>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub clock: ManualClock,
}

/// Core over an in-memory store with the given configuration
///
/// Probes fail until a test says otherwise, so connectivity only changes
/// through explicit transport signals.
pub async fn core_with(config: CoreConfig) -> Core {
    let clock = ManualClock::default();
    let backend = match config.store.capacity_bytes {
        Some(bytes) => MemoryBackend::with_capacity(bytes),
        None => MemoryBackend::new(),
    };
    let store = LocalStore::new(
        Arc::new(backend),
        Arc::new(clock.clone()),
        config.store.default_ttl(),
    );
    let transport = Arc::new(FakeTransport::new());
    transport.set_ping(Err(TransportError::Transient("probe disabled".into())));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let service = SyncService::new(config, store, transport.clone(), fetcher.clone())
        .await
        .expect("Failed to build sync service");
    Core {
        service,
        transport,
        fetcher,
        clock,
    }
}

/// Core with default configuration
pub async fn core() -> Core {
    core_with(CoreConfig::default()).await
}

/// Service over a SQLite file, sharing `transport`
pub async fn sqlite_service(path: &Path, transport: Arc<FakeTransport>) -> SyncService {
    let config = CoreConfig {
        store: StoreConfig {
            database_path: Some(path.to_path_buf()),
            ..StoreConfig::default()
        },
        ..CoreConfig::default()
    };
    let store = LocalStore::open_sqlite(&config.store, Arc::new(ManualClock::default()))
        .await
        .expect("Failed to open SQLite store");
    SyncService::new(config, store, transport, Arc::new(ScriptedFetcher::new()))
        .await
        .expect("Failed to build sync service")
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
