//! Process entrypoint: wires infra (tracing, sqlite, redis) to the core
//! components and runs the downloads/utility worker pools plus the watch
//! ticker until shutdown. There is no HTTP layer here — route handlers are
//! an external collaborator (spec §1) that would sit in front of
//! [`discflow::Scheduler`] in a full deployment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use discflow::config::{load_main_config, InfraConfig};
use discflow::services::artist_fanout::ArtistFanout;
use discflow::services::external::{DeezerThenSpotifyResolver, FetchClient, ServiceAccount};
use discflow::services::history_store::HistoryStore;
use discflow::services::metadata_provider::{CatalogClient, MetadataProvider, SpotifyCatalogClient};
use discflow::services::rate_limiter::{RateLimiter, RateLimiterConfig, RedisBackend};
use discflow::services::scheduler::{new_pool_channel, Scheduler, WorkerPool};
use discflow::services::task_state_store::{RedisCoordinationStore, TaskStateStore};
use discflow::services::watch_engine::WatchEngine;
use discflow::services::watch_store::WatchStore;
use discflow::services::worker::WorkerPoolRunner;
use discflow::{AppError, FetchEvent, Result, TaskKind, TaskParameters};

/// Stand-in for the real audio-fetch library (spec §1: "the actual
/// audio-fetch library ... is treated as a black-box callable"). It is out
/// of scope for this crate to implement; a production deployment supplies
/// its own [`FetchClient`] binding in its place.
struct UnwiredFetchClient;

#[async_trait]
impl FetchClient for UnwiredFetchClient {
    async fn run(
        &self,
        _kind: TaskKind,
        _source_url: &str,
        _account: ServiceAccount,
        _parameters: &TaskParameters,
        _on_event: Box<dyn Fn(FetchEvent) + Send + Sync>,
    ) -> Result<FetchEvent> {
        Err(AppError::FetchError {
            message: "no fetch library binding configured for this deployment".to_string(),
            can_retry: false,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let infra = InfraConfig::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&infra.rust_log))
        .init();

    info!("starting discflow download orchestrator");

    let main_config = load_main_config(&infra.config_dir)?;
    info!(version = %main_config.version, "loaded main.json");

    let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&infra.database_url)
        .await?;

    let history = Arc::new(HistoryStore::new(sqlite_pool.clone()));
    history.ensure_schema().await?;

    let watch_store = Arc::new(WatchStore::new(sqlite_pool.clone()));
    watch_store.ensure_schema().await?;

    let redis_cfg = deadpool_redis::Config::from_url(&infra.redis_url);
    let redis_pool = redis_cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

    let tss = TaskStateStore::new(Arc::new(RedisCoordinationStore::new(redis_pool.clone())));

    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(RedisBackend::new(redis_pool.clone())),
        RateLimiterConfig::default(),
    ));
    rate_limiter.cleanup_on_startup().await?;

    let catalog_client: Arc<dyn CatalogClient> = Arc::new(SpotifyCatalogClient::new(
        infra.spotify_client_id.clone(),
        infra.spotify_client_secret.clone(),
    ));
    let metadata = Arc::new(MetadataProvider::new(catalog_client, rate_limiter.clone()));

    let (downloads_tx, downloads_rx) = new_pool_channel();
    let (utility_tx, utility_rx) = new_pool_channel();
    let mut pools = HashMap::new();
    pools.insert(WorkerPool::Downloads, downloads_tx);
    pools.insert(WorkerPool::Utility, utility_tx);

    let scheduler = Arc::new(Scheduler::new(
        tss.clone(),
        pools,
        main_config.downloads.max_retries,
    ));

    let fetch_client: Arc<dyn FetchClient> = Arc::new(UnwiredFetchClient);
    let credential_resolver = Arc::new(DeezerThenSpotifyResolver);

    let downloads_runner = Arc::new(WorkerPoolRunner::new(
        WorkerPool::Downloads,
        tss.clone(),
        history.clone(),
        fetch_client.clone(),
        credential_resolver.clone(),
        main_config.downloads.clone(),
        main_config.downloads.max_concurrent_downloads as usize,
    ));
    let utility_runner = Arc::new(WorkerPoolRunner::new(
        WorkerPool::Utility,
        tss.clone(),
        history.clone(),
        fetch_client.clone(),
        credential_resolver.clone(),
        main_config.downloads.clone(),
        3,
    ));

    let downloads_handle = tokio::spawn(downloads_runner.clone().run(downloads_rx));
    let utility_handle = tokio::spawn(utility_runner.clone().run(utility_rx));

    // Artist fan-out (spec §4.7) is reachable for an external caller via
    // `ArtistFanout`; it is constructed here so the binary links it, but
    // driving it per submission is the route-handler layer's job (§1).
    let _artist_fanout = ArtistFanout::new(
        metadata.clone(),
        scheduler.clone(),
        tss.clone(),
        main_config.downloads.clone(),
        main_config.watch.watched_artist_album_group.clone(),
    );

    let watch_handle = if main_config.watch.enabled {
        let engine = Arc::new(WatchEngine::new(
            watch_store.clone(),
            metadata.clone(),
            scheduler.clone(),
            main_config.watch.clone(),
            main_config.downloads.clone(),
            infra.downloads_dir.clone(),
        ));
        Some(tokio::spawn(engine.run()))
    } else {
        info!("watch subsystem disabled (watch.enabled=false)");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    downloads_runner.shutdown_handle().store(true, std::sync::atomic::Ordering::SeqCst);
    utility_runner.shutdown_handle().store(true, std::sync::atomic::Ordering::SeqCst);
    downloads_handle.abort();
    utility_handle.abort();
    if let Some(handle) = watch_handle {
        handle.abort();
    }

    warn!("discflow shutting down");
    Ok(())
}
