use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clickedge::backend::HttpBackendClient;
use clickedge::config::{Config, StorageBackend};
use clickedge::detection::GeoIpService;
use clickedge::edge::{create_edge_router, EdgeRouter};
use clickedge::storage::{FsBlobStore, KvStore, MemoryKv, SqliteKv};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!(
        environment = %config.environment,
        edge_location = %config.edge_location,
        "Loaded configuration"
    );

    // Sqlite handle is kept for expiry purges
    let mut sqlite: Option<Arc<SqliteKv>> = None;
    let kv: Arc<dyn KvStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.storage.url);
            let store = Arc::new(SqliteKv::new(&config.storage.url, 8).await?);
            sqlite = Some(Arc::clone(&store));
            store
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, queued clicks will not survive a restart");
            Arc::new(MemoryKv::new())
        }
    };
    kv.init().await?;

    let blobs = Arc::new(FsBlobStore::new(&config.storage.overflow_dir).await?);
    let backend = Arc::new(HttpBackendClient::new(&config.backend)?);

    let geoip = match GeoIpService::new(
        config.network.geoip_city_db_path.as_deref(),
        config.network.geoip_asn_db_path.as_deref(),
    ) {
        Ok(service) if service.is_configured() => {
            info!("🌍 MaxMind GeoIP fallback enabled");
            Some(Arc::new(service))
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "GeoIP databases could not be loaded, relying on edge headers only");
            None
        }
    };

    let flush_interval = Duration::from_secs(config.queue.flush_interval_secs.max(1));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let edge = Arc::new(EdgeRouter::new(config, Arc::clone(&kv), blobs, backend, geoip)?);

    // Clicks persisted by a previous process must be back in the buffer before serving
    let restored = edge.queue().restore().await?;
    info!(restored, "Click queue ready");
    let queue_task = edge.queue().start(flush_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance_task = spawn_maintenance(Arc::clone(&edge), sqlite.clone(), shutdown_rx);

    let app = create_edge_router(Arc::clone(&edge));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Edge server listening on http://{}", addr);
    info!("   - Click redirects at http://{}/c/{{signedCode}}", addr);
    info!("   - Diagnostics at http://{}/edge/diagnostics", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped, draining background work...");
    // Redirected clicks must reach the queue before its final flush
    let drained = edge.drain_deferred().await;
    info!(drained, "Deferred click work finished");
    let _ = shutdown_tx.send(true);
    edge.queue().shutdown();
    if let Err(e) = queue_task.await {
        warn!(error = %e, "click queue task ended abnormally");
    }
    let _ = maintenance_task.await;
    edge.persist_metrics().await;
    if let Some(sqlite) = sqlite {
        sqlite.close().await;
    }
    info!("Shutdown complete");

    Ok(())
}

/// Backend health probes with emergency re-delivery, metric snapshots and expiry purges
fn spawn_maintenance(
    edge: Arc<EdgeRouter>,
    sqlite: Option<Arc<SqliteKv>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut health_ticker = time::interval(HEALTH_PROBE_INTERVAL);
        let mut maintenance_ticker = time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = health_ticker.tick() => {
                    let status = edge.probe_backend().await;
                    if !status.healthy {
                        warn!(failures = status.consecutive_failures, "Backend health probe failed");
                    }
                }
                _ = maintenance_ticker.tick() => {
                    edge.persist_metrics().await;
                    if let Some(sqlite) = &sqlite {
                        match sqlite.purge_expired().await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "Purged expired entries"),
                            Err(e) => warn!(error = %e, "Failed to purge expired entries"),
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}
