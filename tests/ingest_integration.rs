//! End-to-end ingest + resolve flow against the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tokio::sync::broadcast;

use scoutfeed_backend::{
    admin::AdminActions,
    feeds::{
        AdvisoryLocks, FeedScheduler, IngestEngine, IngestLimits, IngestQueues, MemoryConnector,
        MemoryTransport, TransportTimeouts,
    },
    jobs::JobQueue,
    metrics::Metrics,
    models::{
        now_ts, Compression, FeedStatus, LinkStatus, Pipeline, RunStatus, TransportKind,
    },
    resolver::{
        BrandAliasCache, EmbeddingJob, ResolveJob, Resolver, ResolverWorker, TrustCache,
    },
    runlog::RunLogger,
    store::{NewFeed, Store},
};

struct Stack {
    store: Store,
    transport: MemoryTransport,
    scheduler: Arc<FeedScheduler>,
    admin: Arc<AdminActions>,
    metrics: Arc<Metrics>,
    _db: NamedTempFile,
    _logs: TempDir,
}

fn build_stack() -> Stack {
    let db = NamedTempFile::new().unwrap();
    let logs = TempDir::new().unwrap();

    let store = Store::open(db.path().to_str().unwrap()).unwrap();
    let metrics = Metrics::new();
    let locks = AdvisoryLocks::new();
    let runlog = RunLogger::new(logs.path());

    let resolve_queue: JobQueue<ResolveJob> =
        JobQueue::new("product-resolve", 3, Duration::from_millis(20));
    let ingest_queues = IngestQueues::new(1, Duration::from_millis(20));
    let embedding_queue: JobQueue<EmbeddingJob> =
        JobQueue::new("embedding-generate", 1, Duration::from_millis(20));

    let trust_cache = TrustCache::new(store.clone());
    let alias_cache = BrandAliasCache::new(store.clone());
    alias_cache.rebuild().unwrap();
    let (alias_tx, _alias_rx) = broadcast::channel(8);

    let resolver = Resolver::new(store.clone(), trust_cache.clone(), alias_cache);
    let worker = ResolverWorker::new(
        store.clone(),
        resolver,
        metrics.clone(),
        embedding_queue,
        runlog.clone(),
    );
    worker.spawn(&resolve_queue, 5);

    let transport = MemoryTransport::new();
    let connector = {
        let store = store.clone();
        Arc::new(MemoryConnector::new(
            transport.clone(),
            TransportTimeouts {
                control: Duration::from_millis(500),
                data: Duration::from_millis(500),
            },
            move || store.get_setting_bool("ALLOW_PLAIN_FTP", false),
        ))
    };

    let engine = IngestEngine::new(
        store.clone(),
        locks.clone(),
        connector,
        resolve_queue,
        ingest_queues.clone(),
        metrics.clone(),
        runlog,
        IngestLimits {
            default_max_file_size_bytes: 10 * 1024 * 1024,
            default_max_row_count: 10_000,
            row_error_threshold: 100,
            resolve_debounce: Duration::from_millis(30),
        },
    );
    engine.spawn(2);

    let scheduler = FeedScheduler::new(store.clone(), ingest_queues);
    let admin = AdminActions::new(
        store.clone(),
        locks,
        scheduler.clone(),
        trust_cache,
        alias_tx,
    );

    Stack {
        store,
        transport,
        scheduler,
        admin,
        metrics,
        _db: db,
        _logs: logs,
    }
}

fn seed_feed(store: &Store, source_id: i64) -> i64 {
    let feed_id = store
        .insert_feed(&NewFeed {
            source_id,
            network: "avantlink".to_string(),
            retailer_slug: "midway-outfitters".to_string(),
            pipeline: Pipeline::Affiliate,
            transport: TransportKind::Sftp,
            host: "feeds.example.com".to_string(),
            port: 22,
            remote_path: "/export/catalog.csv".to_string(),
            username: "scout".to_string(),
            secret_blob: Some("c2VjcmV0".to_string()),
            secret_key_id: Some("local-1".to_string()),
            compression: Compression::None,
            schedule_frequency_hours: Some(24),
            expiry_hours: 72,
            feed_lock_id: 4200 + source_id,
        })
        .unwrap();
    store.set_feed_status(feed_id, FeedStatus::Enabled).unwrap();
    store.set_next_run_at(feed_id, Some(now_ts() - 5)).unwrap();
    feed_id
}

const CATALOG_CSV: &str = "\
Name,Url,Manufacturer,UPC,SKU,Price
Federal 9mm Luger 124gr JHP 50 Rounds,https://shop.test/p/f9,Federal,012345678901,F9-124,24.99
Hornady 6.5 Creedmoor 140gr ELD Match 20 Rounds,https://shop.test/p/h65,Hornady,,H65-140,38.50
Federal Top Gun 12ga 2-3/4in #8 Shot 25 Rounds,https://shop.test/p/tg12,Federal,,TG12-8,9.99
";

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Tick the scheduler until the condition holds. Re-ticking covers the small
/// window where the previous ingest job still holds its queue id.
async fn tick_until<F: Fn() -> bool>(scheduler: &FeedScheduler, what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        let _ = scheduler.tick_once();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_scheduled_ingest_resolves_rows_end_to_end() {
    let stack = build_stack();
    let feed_id = seed_feed(&stack.store, 1);
    stack.store.upsert_trust_config(1, true).unwrap();
    stack
        .transport
        .put_file("/export/catalog.csv", CATALOG_CSV.as_bytes().to_vec(), 1_700_000_000);

    assert_eq!(stack.scheduler.tick_once().unwrap(), 1);

    // Run completes.
    let store = stack.store.clone();
    wait_for("run to succeed", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Succeeded)
            .unwrap_or(false)
    })
    .await;

    let run = stack.store.latest_run(feed_id).unwrap().unwrap();
    assert_eq!(run.counters.rows_read, 3);
    assert_eq!(run.counters.rows_parsed, 3);
    assert_eq!(run.counters.products_upserted, 3);
    assert_eq!(run.counters.prices_written, 3);
    assert_eq!(run.counters.products_promoted, 3);
    assert_eq!(run.counters.error_count, 0);
    assert!(!run.expiry_blocked);

    // Feed change-detection state and schedule advanced.
    let feed = stack.store.get_feed(feed_id).unwrap().unwrap();
    assert_eq!(feed.last_remote_mtime, Some(1_700_000_000));
    assert!(feed.last_content_hash.is_some());
    assert!(feed.next_run_at.unwrap() > now_ts());
    assert_eq!(feed.consecutive_failures, 0);

    // All three rows resolve: trusted UPC, rifle identity key, shotgun
    // identity key.
    let store = stack.store.clone();
    wait_for("links to resolve", || {
        (1..=3).all(|spid| {
            store
                .get_link(spid)
                .unwrap()
                .map(|l| matches!(l.status, LinkStatus::Matched | LinkStatus::Created))
                .unwrap_or(false)
        })
    })
    .await;

    let upc_link = stack.store.get_link(1).unwrap().unwrap();
    let product = stack
        .store
        .get_product(upc_link.product_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(product.canonical_key, "UPC:012345678901");

    let shotgun_link = stack.store.get_link(3).unwrap().unwrap();
    let shotgun = stack
        .store
        .get_product(shotgun_link.product_id.unwrap())
        .unwrap()
        .unwrap();
    assert!(shotgun.canonical_key.starts_with("FP_SG:v1:"));

    // Metrics exposition reflects the run.
    let text = stack.metrics.to_prometheus();
    assert!(text.contains("ingest_runs_total{pipeline=\"affiliate\",status=\"SUCCEEDED\"} 1"));
}

#[tokio::test]
async fn test_unchanged_feed_is_skipped() {
    let stack = build_stack();
    let feed_id = seed_feed(&stack.store, 2);
    stack
        .transport
        .put_file("/export/catalog.csv", CATALOG_CSV.as_bytes().to_vec(), 1_700_000_000);

    stack.scheduler.tick_once().unwrap();
    let store = stack.store.clone();
    wait_for("first run to succeed", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Succeeded)
            .unwrap_or(false)
    })
    .await;

    // Same file, same stat: the second run must record UNCHANGED_STAT.
    stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();
    let store = stack.store.clone();
    tick_until(&stack.scheduler, "second run to skip", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Skipped)
            .unwrap_or(false)
    })
    .await;

    let run = stack.store.latest_run(feed_id).unwrap().unwrap();
    assert_eq!(run.failure_code.as_deref(), Some("UNCHANGED_STAT"));

    // Force reprocess clears detection state; the same bytes ingest again.
    assert!(stack.admin.force_reprocess(feed_id).unwrap().success);
    stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();
    let store = stack.store.clone();
    tick_until(&stack.scheduler, "reprocessed run to succeed", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Succeeded)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_transport_failures_trip_auto_disable() {
    let stack = build_stack();
    let feed_id = seed_feed(&stack.store, 3);
    stack.transport.set_fail_auth(true);

    for attempt in 0..3 {
        stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();
        let store = stack.store.clone();
        let expected_failures = attempt + 1;
        tick_until(&stack.scheduler, "run to fail", move || {
            store
                .get_feed(feed_id)
                .unwrap()
                .map(|f| f.consecutive_failures >= expected_failures)
                .unwrap_or(false)
        })
        .await;
    }

    let feed = stack.store.get_feed(feed_id).unwrap().unwrap();
    assert_eq!(feed.consecutive_failures, 3);
    assert_eq!(feed.status, FeedStatus::Disabled);

    let run = stack.store.latest_run(feed_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_code.as_deref(), Some("AUTH"));
    assert_eq!(run.failure_kind.map(|k| k.as_str()), Some("TRANSPORT"));

    // Re-enable resets the streak.
    stack.transport.set_fail_auth(false);
    assert!(stack.admin.reenable_feed(feed_id).unwrap().success);
    let feed = stack.store.get_feed(feed_id).unwrap().unwrap();
    assert_eq!(feed.status, FeedStatus::Enabled);
    assert_eq!(feed.consecutive_failures, 0);
}

#[tokio::test]
async fn test_expiry_circuit_breaker_blocks_and_approval_promotes() {
    let stack = build_stack();
    let feed_id = seed_feed(&stack.store, 4);
    stack
        .transport
        .put_file("/export/catalog.csv", CATALOG_CSV.as_bytes().to_vec(), 1_700_000_000);

    stack.scheduler.tick_once().unwrap();
    let store = stack.store.clone();
    wait_for("baseline run to succeed", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Succeeded && r.counters.products_promoted == 3)
            .unwrap_or(false)
    })
    .await;

    // The next file dropped two of three products: promotion would expire
    // 2/3 > 50%, so the circuit breaker blocks it.
    let shrunk = "\
Name,Url,Manufacturer,UPC,SKU,Price
Federal 9mm Luger 124gr JHP 50 Rounds,https://shop.test/p/f9,Federal,012345678901,F9-124,23.99
";
    stack
        .transport
        .put_file("/export/catalog.csv", shrunk.as_bytes().to_vec(), 1_700_100_000);
    stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();

    let store = stack.store.clone();
    tick_until(&stack.scheduler, "blocked run", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status.is_terminal() && r.expiry_blocked)
            .unwrap_or(false)
    })
    .await;

    let blocked = stack.store.latest_run(feed_id).unwrap().unwrap();
    assert_eq!(blocked.status, RunStatus::Succeeded);
    assert!(blocked.expiry_blocked);
    assert_eq!(blocked.counters.products_promoted, 0);
    assert_eq!(blocked.failure_code.as_deref(), Some("CIRCUIT_OPEN"));

    // Admin approval promotes the seen set.
    let outcome = stack.admin.approve_activation(&blocked.id, "ops").unwrap();
    assert!(outcome.success, "{}", outcome.message);

    let approved = stack.store.get_run(&blocked.id).unwrap().unwrap();
    assert_eq!(approved.expiry_approved_by.as_deref(), Some("ops"));
    assert_eq!(approved.counters.products_promoted, 1);
}

#[tokio::test]
async fn test_plain_ftp_requires_setting() {
    let stack = build_stack();
    let feed_id = stack
        .store
        .insert_feed(&NewFeed {
            source_id: 5,
            network: "legacy".to_string(),
            retailer_slug: "legacy-shop".to_string(),
            pipeline: Pipeline::Retailer,
            transport: TransportKind::Ftp,
            host: "ftp.example.com".to_string(),
            port: 21,
            remote_path: "/export/catalog.csv".to_string(),
            username: "scout".to_string(),
            secret_blob: Some("c2VjcmV0".to_string()),
            secret_key_id: None,
            compression: Compression::None,
            schedule_frequency_hours: Some(24),
            expiry_hours: 72,
            feed_lock_id: 4999,
        })
        .unwrap();
    stack.store.set_feed_status(feed_id, FeedStatus::Enabled).unwrap();
    stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();
    stack
        .transport
        .put_file("/export/catalog.csv", CATALOG_CSV.as_bytes().to_vec(), 1_700_000_000);

    let store = stack.store.clone();
    tick_until(&stack.scheduler, "ftp run to fail", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let run = stack.store.latest_run(feed_id).unwrap().unwrap();
    assert_eq!(run.failure_code.as_deref(), Some("TRANSPORT_NOT_ALLOWED"));

    // With the global setting on, plain FTP is allowed.
    stack.store.set_setting_bool("ALLOW_PLAIN_FTP", true).unwrap();
    stack.store.set_next_run_at(feed_id, Some(now_ts() - 1)).unwrap();
    let store = stack.store.clone();
    tick_until(&stack.scheduler, "ftp run to succeed", || {
        store
            .latest_run(feed_id)
            .unwrap()
            .map(|r| r.status == RunStatus::Succeeded)
            .unwrap_or(false)
    })
    .await;
}
