//! One run of one feed: lock, stat, change-detect, download, parse, row
//! pipeline, expiry circuit breaker, finalize.
//!
//! Failures are recorded on the run row and never crash the worker; the
//! scheduler simply tries again at the next due time.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::feeds::locks::AdvisoryLocks;
use crate::feeds::parser::{self, ParseError, ParseLimits};
use crate::feeds::transport::{TransportConnector, TransportError};
use crate::jobs::JobQueue;
use crate::metrics::{ErrorSummary, IngestRunSummary, Metrics, RunTiming};
use crate::models::{
    now_ts, FailureCode, Feed, FeedStatus, Pipeline, RunCounters, RunStatus, RunTrigger,
    SkipReason,
};
use crate::normalize::{self, extract};
use crate::resolver::{resolve_job_id, ResolveJob, RESOLVER_VERSION};
use crate::runlog::{RunLogFile, RunLogger};
use crate::store::{NewSourceProduct, Store};

/// Payload of one feed-ingest job.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub feed_id: i64,
    pub trigger: RunTrigger,
}

/// One active ingest job per feed.
pub fn ingest_job_id(feed_id: i64) -> String {
    format!("FEED_INGEST_{}", feed_id)
}

/// The two ingest queues, one per pipeline.
#[derive(Clone)]
pub struct IngestQueues {
    pub affiliate: JobQueue<IngestJob>,
    pub retailer: JobQueue<IngestJob>,
}

impl IngestQueues {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            affiliate: JobQueue::new("affiliate-feed-ingest", max_attempts, base_backoff),
            retailer: JobQueue::new("retailer-feed-ingest", max_attempts, base_backoff),
        }
    }

    pub fn for_pipeline(&self, pipeline: Pipeline) -> &JobQueue<IngestJob> {
        match pipeline {
            Pipeline::Affiliate => &self.affiliate,
            Pipeline::Retailer => &self.retailer,
        }
    }
}

/// Global parse/size defaults applied when the feed has no override.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub default_max_file_size_bytes: u64,
    pub default_max_row_count: u64,
    pub row_error_threshold: u64,
    pub resolve_debounce: Duration,
}

const AUTO_DISABLE_AFTER_FAILURES: i64 = 3;

/// How the body of a run ended, before finalization.
enum RunEnd {
    Succeeded { expiry_blocked: Option<String> },
    Skipped(SkipReason),
}

struct RunFailure {
    code: FailureCode,
    message: String,
}

impl From<TransportError> for RunFailure {
    fn from(e: TransportError) -> Self {
        Self {
            code: e.failure_code(),
            message: e.to_string(),
        }
    }
}

impl From<ParseError> for RunFailure {
    fn from(e: ParseError) -> Self {
        let code = match e {
            ParseError::TooManyRows { .. } => FailureCode::TooManyRows,
            _ => FailureCode::ParseError,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

pub struct IngestEngine {
    store: Store,
    locks: Arc<AdvisoryLocks>,
    connector: Arc<dyn TransportConnector>,
    resolve_queue: JobQueue<ResolveJob>,
    ingest_queues: IngestQueues,
    metrics: Arc<Metrics>,
    runlog: Arc<RunLogger>,
    limits: IngestLimits,
}

impl IngestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        locks: Arc<AdvisoryLocks>,
        connector: Arc<dyn TransportConnector>,
        resolve_queue: JobQueue<ResolveJob>,
        ingest_queues: IngestQueues,
        metrics: Arc<Metrics>,
        runlog: Arc<RunLogger>,
        limits: IngestLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            connector,
            resolve_queue,
            ingest_queues,
            metrics,
            runlog,
            limits,
        })
    }

    /// Attach the engine to both ingest queues.
    pub fn spawn(self: &Arc<Self>, concurrency: usize) {
        for queue in [
            self.ingest_queues.affiliate.clone(),
            self.ingest_queues.retailer.clone(),
        ] {
            let engine = self.clone();
            queue.run_workers(concurrency, move |job| {
                let engine = engine.clone();
                async move {
                    engine.run_feed(job.payload.feed_id, job.payload.trigger).await;
                    Ok(())
                }
            });
        }
    }

    /// Execute one run. All outcomes, including system errors, end up on the
    /// run row; this function itself never fails the queue job.
    pub async fn run_feed(&self, feed_id: i64, trigger: RunTrigger) {
        let feed = match self.store.get_feed(feed_id) {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                warn!(feed_id, "ingest job for unknown feed, dropping");
                return;
            }
            Err(e) => {
                error!(feed_id, error = %e, "failed to load feed for ingest");
                return;
            }
        };

        // At most one run per feed; the advisory lock is the authoritative
        // barrier, the scheduler's in-flight filter only reduces noise.
        let Some(_guard) = self.locks.try_lock(feed.feed_lock_id) else {
            self.record_skipped_without_lock(&feed, trigger, SkipReason::LockBusy);
            return;
        };

        let run_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();
        if let Err(e) = self
            .store
            .create_run(&run_id, feed.id, trigger, &correlation_id)
        {
            error!(feed_id, error = %e, "failed to create feed run");
            return;
        }

        let log = self
            .runlog
            .open_feed_run(feed.pipeline, &feed.retailer_slug)
            .ok();
        if let Some(log) = &log {
            let _ = log.line(&format!(
                "run {} start feed={} trigger={} correlation={}",
                run_id,
                feed.id,
                trigger.as_str(),
                correlation_id
            ));
        }

        let started = Instant::now();
        let mut counters = RunCounters::default();
        let mut timing = RunTiming::default();

        let body = self
            .execute(&feed, &run_id, &mut counters, &mut timing, log.as_ref())
            .await;

        let finalize_started = Instant::now();
        let status = match body {
            Ok(RunEnd::Succeeded { expiry_blocked }) => {
                self.finalize_success(&feed, &run_id, &counters, expiry_blocked)
            }
            Ok(RunEnd::Skipped(reason)) => self.finalize_skipped(&feed, &run_id, &counters, reason),
            Err(failure) => self.finalize_failure(&feed, &run_id, &counters, failure),
        };
        timing.finalize_ms = finalize_started.elapsed().as_millis() as u64;

        self.reschedule(&feed);

        // Release the advisory lock before queueing any follow-up run, so a
        // pending manual run does not bounce off our own lock.
        drop(_guard);
        self.enqueue_manual_followup(&feed);

        if let Some(log) = &log {
            let _ = log.line(&format!("run {} finished status={}", run_id, status.as_str()));
        }

        self.metrics.ingest.record_run(feed.pipeline, status);
        self.emit_summary(&feed, &run_id, trigger, status, started, timing, &counters);
    }

    /// Steps 2-6: everything between lock acquisition and finalization.
    async fn execute(
        &self,
        feed: &Feed,
        run_id: &str,
        counters: &mut RunCounters,
        timing: &mut RunTiming,
        log: Option<&RunLogFile>,
    ) -> Result<RunEnd, RunFailure> {
        let transport = self.connector.connect(feed).await?;

        // Stat + change detection.
        let stat_started = Instant::now();
        let stat = transport.stat(&feed.remote_path).await?;
        timing.stat_ms = stat_started.elapsed().as_millis() as u64;

        let stat_unchanged = feed.last_remote_mtime == Some(stat.mtime)
            && feed.last_remote_size == Some(stat.size as i64);
        if stat_unchanged {
            let has_success = self
                .store
                .has_successful_run(feed.id)
                .map_err(internal_failure)?;
            if has_success {
                if let Some(log) = log {
                    let _ = log.line("remote stat unchanged, skipping");
                }
                return Ok(RunEnd::Skipped(SkipReason::UnchangedStat));
            }
        }

        // Download, bounded.
        let max_bytes = feed
            .max_file_size_bytes
            .unwrap_or(self.limits.default_max_file_size_bytes);
        let download_started = Instant::now();
        let bytes = transport.download(&feed.remote_path, max_bytes).await?;
        timing.download_ms = download_started.elapsed().as_millis() as u64;

        let content_hash = normalize::sha256_hex(&bytes);
        if feed.last_content_hash.as_deref() == Some(content_hash.as_str()) {
            // Content identical under a new mtime: remember the new stat so
            // the cheaper stat check short-circuits next time.
            let _ = self.store.update_change_detection(
                feed.id,
                Some(stat.mtime),
                Some(stat.size as i64),
                Some(&content_hash),
            );
            if let Some(log) = log {
                let _ = log.line("content hash unchanged, skipping");
            }
            return Ok(RunEnd::Skipped(SkipReason::UnchangedHash));
        }

        // Parse.
        let parse_started = Instant::now();
        let plain = parser::decompress(&bytes, feed.compression)?;
        let parse_limits = ParseLimits {
            max_row_count: feed
                .max_row_count
                .unwrap_or(self.limits.default_max_row_count),
            row_error_threshold: self.limits.row_error_threshold,
        };
        let parsed = parser::parse_catalog_csv(&plain, &parse_limits)?;
        timing.parse_ms = parse_started.elapsed().as_millis() as u64;

        counters.rows_read = parsed.rows_read;
        counters.rows_parsed = parsed.rows.len() as u64;
        counters.error_count = parsed.errors.len() as u64;

        for row_error in &parsed.errors {
            let _ = self.store.insert_run_error(
                run_id,
                Some(row_error.row_number),
                FailureCode::ParseError.as_str(),
                &row_error.message,
            );
        }

        if let Some(log) = log {
            let _ = log.line(&format!(
                "parsed rows={} errors={} bytes={}",
                counters.rows_parsed,
                counters.error_count,
                bytes.len()
            ));
        }

        // Row pipeline.
        let rows_started = Instant::now();
        let mut seen_keys: HashSet<String> = HashSet::with_capacity(parsed.rows.len());
        for row in &parsed.rows {
            let (stable_key, via_url_hash) = match stable_row_key(row) {
                Some(key) => key,
                None => {
                    counters.error_count += 1;
                    let _ = self.store.insert_run_error(
                        run_id,
                        Some(row.row_number),
                        FailureCode::ParseError.as_str(),
                        "row has neither SKU nor URL, cannot derive stable key",
                    );
                    continue;
                }
            };
            if via_url_hash {
                counters.url_hash_fallback_count += 1;
            }
            if !seen_keys.insert(stable_key.clone()) {
                counters.duplicate_key_count += 1;
                continue;
            }

            let upserted = self
                .store
                .upsert_source_product(&source_product_from_row(feed, row, stable_key))
                .map_err(internal_failure)?;

            counters.products_upserted += 1;
            if upserted.created {
                self.metrics.ingest.add_listings_created(feed.pipeline, 1);
            } else {
                self.metrics.ingest.add_listings_updated(feed.pipeline, 1);
            }
            if upserted.price_written {
                counters.prices_written += 1;
            }

            self.store
                .record_seen(run_id, upserted.id)
                .map_err(internal_failure)?;
            self.store
                .ensure_pending_request(upserted.id)
                .map_err(internal_failure)?;
            self.resolve_queue.enqueue_delayed(
                resolve_job_id(upserted.id),
                ResolveJob {
                    source_product_id: upserted.id,
                    trigger: crate::models::ResolveTrigger::Ingest,
                    resolver_version: RESOLVER_VERSION,
                    feed_run_id: Some(run_id.to_string()),
                },
                self.limits.resolve_debounce,
            );
        }
        timing.row_pipeline_ms = rows_started.elapsed().as_millis() as u64;
        self.metrics
            .ingest
            .add_prices_written(feed.pipeline, counters.prices_written);

        // Expiry circuit breaker over the seen set.
        let active_cutoff = now_ts() - feed.expiry_hours * 3600;
        let active = self
            .store
            .count_active_products(feed.source_id, active_cutoff)
            .map_err(internal_failure)?;
        let missing = self
            .store
            .count_active_unseen(feed.source_id, run_id, active_cutoff)
            .map_err(internal_failure)?;

        if active > 0 && (missing as f64 / active as f64) > feed.expiry_block_fraction {
            counters.products_rejected = missing;
            let reason = format!(
                "promotion would expire {} of {} active products (threshold {:.0}%)",
                missing,
                active,
                feed.expiry_block_fraction * 100.0
            );
            if let Some(log) = log {
                let _ = log.line(&format!("expiry circuit breaker tripped: {}", reason));
            }
            // Remember the processed file; promotion waits for approval.
            let _ = self.store.update_change_detection(
                feed.id,
                Some(stat.mtime),
                Some(stat.size as i64),
                Some(&content_hash),
            );
            return Ok(RunEnd::Succeeded {
                expiry_blocked: Some(reason),
            });
        }

        let promoted = self
            .store
            .promote_seen_set(run_id, now_ts())
            .map_err(internal_failure)?;
        counters.products_promoted = promoted;

        let _ = self.store.update_change_detection(
            feed.id,
            Some(stat.mtime),
            Some(stat.size as i64),
            Some(&content_hash),
        );

        Ok(RunEnd::Succeeded {
            expiry_blocked: None,
        })
    }

    fn finalize_success(
        &self,
        feed: &Feed,
        run_id: &str,
        counters: &RunCounters,
        expiry_blocked: Option<String>,
    ) -> RunStatus {
        let (code, kind, message) = match &expiry_blocked {
            Some(reason) => (
                Some(FailureCode::CircuitOpen.as_str()),
                Some(FailureCode::CircuitOpen.kind().as_str()),
                Some(reason.as_str()),
            ),
            None => (None, None, None),
        };
        let _ = self.store.finalize_run(
            run_id,
            RunStatus::Succeeded,
            counters,
            code,
            kind,
            message,
            expiry_blocked.is_some(),
            expiry_blocked.as_deref(),
        );
        let _ = self.store.reset_consecutive_failures(feed.id);
        RunStatus::Succeeded
    }

    fn finalize_skipped(
        &self,
        _feed: &Feed,
        run_id: &str,
        counters: &RunCounters,
        reason: SkipReason,
    ) -> RunStatus {
        let _ = self.store.finalize_run(
            run_id,
            RunStatus::Skipped,
            counters,
            Some(reason.as_str()),
            None,
            None,
            false,
            None,
        );
        RunStatus::Skipped
    }

    fn finalize_failure(
        &self,
        feed: &Feed,
        run_id: &str,
        counters: &RunCounters,
        failure: RunFailure,
    ) -> RunStatus {
        warn!(
            feed_id = feed.id,
            run_id,
            code = failure.code.as_str(),
            message = %failure.message,
            "feed run failed"
        );
        let _ = self.store.finalize_run(
            run_id,
            RunStatus::Failed,
            counters,
            Some(failure.code.as_str()),
            Some(failure.code.kind().as_str()),
            Some(&failure.message),
            false,
            None,
        );

        match self.store.increment_consecutive_failures(feed.id) {
            Ok(failures) if failures >= AUTO_DISABLE_AFTER_FAILURES => {
                info!(
                    feed_id = feed.id,
                    failures, "feed auto-disabled after consecutive failures"
                );
                let _ = self.store.set_feed_status(feed.id, FeedStatus::Disabled);
                let _ = self.store.set_next_run_at(feed.id, None);
            }
            Ok(_) => {}
            Err(e) => error!(feed_id = feed.id, error = %e, "failed to bump failure streak"),
        }
        RunStatus::Failed
    }

    /// Recompute `next_run_at` when the feed is still enabled and scheduled.
    fn reschedule(&self, feed: &Feed) {
        let Ok(Some(current)) = self.store.get_feed(feed.id) else {
            return;
        };
        if current.status != FeedStatus::Enabled {
            return;
        }
        if let Some(hours) = current.schedule_frequency_hours {
            let _ = self
                .store
                .set_next_run_at(feed.id, Some(now_ts() + hours * 3600));
        }
    }

    /// A manual run requested while this run was in flight starts now.
    fn enqueue_manual_followup(&self, feed: &Feed) {
        let Ok(Some(current)) = self.store.get_feed(feed.id) else {
            return;
        };
        if !current.manual_run_pending {
            return;
        }
        let _ = self.store.set_manual_run_pending(feed.id, false);
        // The regular job id is still reserved by the job that is finishing
        // right now; a distinct id keeps the follow-up from collapsing into
        // it. The advisory lock still serializes actual execution.
        self.ingest_queues.for_pipeline(feed.pipeline).enqueue(
            format!("{}_MANUAL_PENDING", ingest_job_id(feed.id)),
            IngestJob {
                feed_id: feed.id,
                trigger: RunTrigger::ManualPending,
            },
        );
    }

    fn record_skipped_without_lock(&self, feed: &Feed, trigger: RunTrigger, reason: SkipReason) {
        let run_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();
        if self
            .store
            .create_run(&run_id, feed.id, trigger, &correlation_id)
            .is_err()
        {
            return;
        }
        let counters = RunCounters::default();
        let status = self.finalize_skipped(feed, &run_id, &counters, reason);
        self.metrics.ingest.record_run(feed.pipeline, status);
        self.emit_summary(
            feed,
            &run_id,
            trigger,
            status,
            Instant::now(),
            RunTiming::default(),
            &counters,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_summary(
        &self,
        feed: &Feed,
        run_id: &str,
        trigger: RunTrigger,
        status: RunStatus,
        started: Instant,
        timing: RunTiming,
        counters: &RunCounters,
    ) {
        let run = self.store.get_run(run_id).ok().flatten();
        let error_summary = ErrorSummary {
            error_count: counters.error_count,
            primary_code: run.as_ref().and_then(|r| r.failure_code.clone()),
            code_histogram: if counters.error_count > 0 {
                vec![(
                    FailureCode::ParseError.as_str().to_string(),
                    counters.error_count,
                )]
            } else {
                Vec::new()
            },
        };

        self.metrics.emit_run_summary(IngestRunSummary {
            pipeline: feed.pipeline,
            run_id: run_id.to_string(),
            feed_id: feed.id,
            source_id: feed.source_id,
            retailer_slug: feed.retailer_slug.clone(),
            status,
            trigger,
            duration_ms: started.elapsed().as_millis() as u64,
            timing,
            counters: *counters,
            error_summary,
            expiry_blocked: run.map(|r| r.expiry_blocked).unwrap_or(false),
        });
    }
}

fn internal_failure(e: anyhow::Error) -> RunFailure {
    RunFailure {
        code: FailureCode::SystemError,
        message: format!("{:#}", e),
    }
}

/// Retailer SKU when present, else a hash of the normalized URL.
fn stable_row_key(row: &parser::ParsedRow) -> Option<(String, bool)> {
    if let Some(sku) = &row.sku {
        return Some((sku.clone(), false));
    }
    let url = row.url.as_deref()?;
    let normalized = normalize_url(url);
    Some((normalize::sha256_hex(normalized.as_bytes())[..32].to_string(), true))
}

/// Lowercased, scheme-stripped, query/fragment-free URL for hashing.
pub fn normalize_url(url: &str) -> String {
    let lower = url.trim().to_ascii_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    without_query.trim_end_matches('/').to_string()
}

fn source_product_from_row(
    feed: &Feed,
    row: &parser::ParsedRow,
    stable_key: String,
) -> NewSourceProduct {
    // Cheap structured extraction for the stored row; the resolver
    // re-normalizes from scratch when it runs.
    let text = row.title.as_str();
    let caliber = extract::extract_caliber(text)
        .or_else(|| row.attributes.as_deref().and_then(extract::extract_caliber))
        .map(str::to_string);
    let grain = extract::extract_grain_weight(text)
        .or_else(|| row.attributes.as_deref().and_then(extract::extract_grain_weight));
    let rounds = extract::extract_round_count(text)
        .or_else(|| row.attributes.as_deref().and_then(extract::extract_round_count));

    let mut identifiers = Vec::new();
    if let Some(upc) = &row.upc {
        identifiers.push((crate::models::IdentifierKind::Upc, upc.clone()));
    }
    if let Some(sku) = &row.sku {
        identifiers.push((crate::models::IdentifierKind::Sku, sku.clone()));
    }
    if let Some(asin) = &row.asin {
        identifiers.push((crate::models::IdentifierKind::Asin, asin.clone()));
    }
    if let Some(mpn) = &row.mpn {
        identifiers.push((crate::models::IdentifierKind::Mpn, mpn.clone()));
    }

    NewSourceProduct {
        source_id: feed.source_id,
        stable_key,
        title: row.title.clone(),
        brand: row.brand.clone(),
        url: row.url.clone(),
        normalized_url: row.url.as_deref().map(normalize_url),
        attributes: row.attributes.clone(),
        caliber,
        grain_weight: grain,
        round_count: rounds,
        price_cents: row.price_cents,
        identifiers,
    }
}
