//! ScoutFeed - catalog feed ingestion & product resolution backend.
//!
//! Startup wires the store, caches, queues and background loops, then serves
//! the health/metrics/admin HTTP surface.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scoutfeed_backend::{
    admin::AdminActions,
    api::{self, ApiState},
    feeds::{
        AdvisoryLocks, FeedScheduler, IngestEngine, IngestLimits, IngestQueues, MemoryConnector,
        MemoryTransport, TransportTimeouts,
    },
    jobs::JobQueue,
    metrics::Metrics,
    models::{settings_keys, Config},
    resolver::{
        worker::spawn_embedding_drain, BrandAliasCache, EmbeddingJob, ResolveJob, Resolver,
        ResolverWorker, StuckJobSweeper, TrustCache,
    },
    runlog::RunLogger,
    store::Store,
};

#[derive(Parser, Debug)]
#[command(name = "scoutfeed", about = "Catalog feed ingestion backend")]
struct Args {
    /// Override DATABASE_PATH.
    #[arg(long)]
    db: Option<String>,

    /// Override PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,scoutfeed_backend=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(db = %config.database_path, port = config.port, "starting scoutfeed backend");

    let store = Store::open(&config.database_path)?;
    let metrics = Metrics::new();
    let locks = AdvisoryLocks::new();

    let runlog = RunLogger::new(config.log_dir.clone());
    runlog.spawn_retention_sweeper();

    // Queues.
    let resolve_queue: JobQueue<ResolveJob> =
        JobQueue::new("product-resolve", 3, Duration::from_secs(2));
    let ingest_queues = IngestQueues::new(1, Duration::from_secs(5));
    let embedding_queue: JobQueue<EmbeddingJob> =
        JobQueue::new("embedding-generate", 1, Duration::from_secs(2));

    // Caches.
    let trust_cache = TrustCache::new(store.clone());
    let alias_cache = BrandAliasCache::new(store.clone());
    if let Err(e) = alias_cache.rebuild() {
        info!(error = %e, "initial brand alias load failed, starting empty");
    }
    let (alias_invalidate_tx, alias_invalidate_rx) = broadcast::channel(16);
    alias_cache.spawn_refresh(Duration::from_secs(60), alias_invalidate_rx);

    // Resolver pipeline.
    let resolver = Resolver::new(store.clone(), trust_cache.clone(), alias_cache.clone());
    let worker = ResolverWorker::new(
        store.clone(),
        resolver,
        metrics.clone(),
        embedding_queue.clone(),
        runlog.clone(),
    );
    worker.spawn(&resolve_queue, config.resolver_concurrency);
    spawn_embedding_drain(&embedding_queue);

    let sweeper = StuckJobSweeper::new(store.clone(), resolve_queue.clone());
    sweeper.spawn(Duration::from_secs(config.sweeper_tick_secs));

    // Ingestion. The in-memory transport stands in for the deployment's
    // FTP/SFTP client, which plugs in behind TransportConnector.
    let transport = MemoryTransport::new();
    let connector = {
        let store = store.clone();
        Arc::new(MemoryConnector::new(
            transport,
            TransportTimeouts {
                control: Duration::from_secs(config.control_timeout_secs),
                data: Duration::from_secs(config.data_timeout_secs),
            },
            move || store.get_setting_bool(settings_keys::ALLOW_PLAIN_FTP, false),
        ))
    };

    let engine = IngestEngine::new(
        store.clone(),
        locks.clone(),
        connector,
        resolve_queue.clone(),
        ingest_queues.clone(),
        metrics.clone(),
        runlog.clone(),
        IngestLimits {
            default_max_file_size_bytes: config.default_max_file_size_bytes,
            default_max_row_count: config.default_max_row_count,
            row_error_threshold: config.row_error_threshold,
            resolve_debounce: Duration::from_secs(config.resolve_debounce_secs),
        },
    );
    engine.spawn(2);

    let scheduler = FeedScheduler::new(store.clone(), ingest_queues);
    scheduler.spawn(Duration::from_secs(config.scheduler_tick_secs));

    let admin = AdminActions::new(
        store.clone(),
        locks,
        scheduler.clone(),
        trust_cache,
        alias_invalidate_tx,
    );

    let app = api::router(ApiState {
        store,
        metrics,
        admin,
        scheduler,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "http surface listening");
    axum::serve(listener, app).await.context("http server exited")?;

    Ok(())
}
