//! xfsync simulator
//!
//! Runs the synchronization core on a SQLite store against an in-process
//! transport that flaps connectivity, then prints the final stats as JSON.
//!
//! Usage: `cargo run --features test-utils --bin xfsync-sim [config.toml]`

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use xfsync::loader::{LoadRequest, Priority};
use xfsync::local_db::LocalStore;
use xfsync::offline::NewOperation;
use xfsync::shared::clock::SystemClock;
use xfsync::shared::config::CoreConfig;
use xfsync::shared::error::TransportError;
use xfsync::sync::SyncService;
use xfsync::test_utils::{FakeTransport, ScriptedFetcher};

const FLAPS: usize = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("[Sim] loading config from {}", path);
            CoreConfig::from_file(&path)?
        }
        None => {
            let mut config = CoreConfig::default();
            config.apply_env();
            config
        }
    };
    if config.store.database_path.is_none() {
        config.store.database_path = Some(std::env::temp_dir().join("xfsync-sim.db"));
    }
    config.sync.base_delay_ms = config.sync.base_delay_ms.min(200);
    config.sync.max_delay_ms = config.sync.max_delay_ms.max(config.sync.base_delay_ms);

    let store = LocalStore::open_sqlite(&config.store, Arc::new(SystemClock)).await?;
    let transport = Arc::new(FakeTransport::new());
    transport.push_outcome(Err(TransportError::Transient("502 bad gateway".into())));
    transport.push_outcome(Err(TransportError::Timeout(Duration::from_secs(2))));
    transport.set_send_delay(Duration::from_millis(40));

    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.set_default_delay(Duration::from_millis(60));
    fetcher.set_delay("video:intro", Duration::from_millis(400));

    let mut service = SyncService::new(config, store, transport.clone(), fetcher.clone()).await?;

    // Offline writes
    for n in 0..5 {
        let entity = format!("msg:{}", n % 2);
        service
            .queue_for_sync(NewOperation::create(
                entity,
                serde_json::json!({ "text": format!("message {}", n) }),
            ))
            .await?;
    }
    service.reactions().toggle_reaction("msg:0", "alice", "👍").await?;
    tracing::info!("[Sim] queued {} operations offline", service.queue().pending_count().await);

    service.start()?;
    for flap in 0..FLAPS {
        transport.connect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        transport.disconnect();
        tracing::info!("[Sim] flap {} of {}", flap + 1, FLAPS);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    transport.connect();

    let priorities = [
        ("avatar:alice", Priority::Critical),
        ("avatar:bob", Priority::Critical),
        ("thumb:1", Priority::High),
        ("thumb:2", Priority::High),
        ("page:2", Priority::Medium),
        ("page:3", Priority::Low),
        ("video:intro", Priority::Low),
    ];
    let mut handles = Vec::new();
    for (item_id, priority) in priorities {
        let request = LoadRequest::new(item_id, format!("https://cdn.example.com/{}", item_id));
        handles.push(service.add_item(request, priority).await);
    }
    for outcome in join_all(handles).await {
        match outcome {
            Ok(loaded) => tracing::info!(
                "[Sim] loaded {} ({} bytes, cached: {})",
                loaded.item_id,
                loaded.data.len(),
                loaded.from_cache
            ),
            Err(e) => tracing::warn!("[Sim] load failed: {}", e),
        }
    }

    let settled = tokio::time::timeout(Duration::from_secs(30), async {
        while service.queue().pending_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::warn!("[Sim] queue did not settle in time");
    }

    let stats = service.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("peak fetch concurrency: {}", fetcher.peak_concurrency());

    service.stop();
    Ok(())
}
