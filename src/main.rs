//! Hive Gateway - 单端点意图编排网关
//!
//! 运行方式：
//! ```bash
//! cargo run --bin hive-gateway
//! HIVE__DISPATCH__SYNC_TIMEOUT_MS=3000 cargo run --bin hive-gateway -- config/prod.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::api::create_router;
use hive::config::{load_config, AppConfig, StoreBackend};
use hive::core::{ShutdownCoordinator, ShutdownManager};
use hive::dispatch::{Dispatcher, JobStore, MemoryJobStore};

async fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match cfg.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        #[cfg(feature = "async-sqlite")]
        StoreBackend::Sqlite => {
            let store = hive::dispatch::SqliteJobStore::open(&cfg.store.sqlite_path)
                .await
                .with_context(|| format!("Failed to open {}", cfg.store.sqlite_path.display()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        StoreBackend::Sqlite => anyhow::bail!("store.backend = \"sqlite\" requires the async-sqlite feature"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    hive::observability::init(&cfg.logging);

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();

    let store = open_store(&cfg).await?;
    let dispatcher = Arc::new(
        Dispatcher::from_config(&cfg, store, manager.token()).context("Failed to build dispatcher")?,
    );

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager)).with_timeout(30);
    coordinator.register(dispatcher.workers());

    let app = create_router(Arc::clone(&dispatcher), cfg.server.max_in_flight);
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;

    tracing::info!(
        bind = %cfg.server.bind,
        sync_timeout_ms = cfg.dispatch.sync_timeout_ms,
        flow = %cfg.flow.webhook_base,
        "Starting Hive gateway"
    );

    let shutdown = Arc::clone(&manager);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped, draining background jobs...");
    coordinator.run_cleanup().await;
    Ok(())
}
