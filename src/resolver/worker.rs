//! Queue-bound execution harness around the resolver.
//!
//! Business outcomes (NEEDS_REVIEW, ERROR results) are persisted and never
//! retried. Thrown errors ride the queue's retry policy; the request row is
//! left in PROCESSING for the sweeper unless this was the final attempt.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::jobs::{JobQueue, QueuedJob};
use crate::metrics::Metrics;
use crate::models::{
    now_ts, LinkStatus, Pipeline, ProductLink, ReasonCode, ResolveTrigger, settings_keys,
};
use crate::resolver::engine::{ResolveOutcome, Resolver};
use crate::resolver::evidence::serialize_capped;
use crate::runlog::RunLogger;
use crate::store::Store;

/// Payload of one `product-resolve` job.
#[derive(Debug, Clone)]
pub struct ResolveJob {
    pub source_product_id: i64,
    pub trigger: ResolveTrigger,
    pub resolver_version: u32,
    pub feed_run_id: Option<String>,
}

/// Job id: one live job per source product; duplicates collapse.
pub fn resolve_job_id(source_product_id: i64) -> String {
    format!("RESOLVE_SOURCE_PRODUCT_{}", source_product_id)
}

/// Fire-and-forget embedding generation event.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub product_id: i64,
    pub trigger: ResolveTrigger,
}

pub struct ResolverWorker {
    store: Store,
    resolver: Arc<Resolver>,
    metrics: Arc<Metrics>,
    embedding_queue: JobQueue<EmbeddingJob>,
    runlog: Arc<RunLogger>,
}

impl ResolverWorker {
    pub fn new(
        store: Store,
        resolver: Arc<Resolver>,
        metrics: Arc<Metrics>,
        embedding_queue: JobQueue<EmbeddingJob>,
        runlog: Arc<RunLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            metrics,
            embedding_queue,
            runlog,
        })
    }

    /// Attach this worker to the resolve queue.
    pub fn spawn(self: &Arc<Self>, queue: &JobQueue<ResolveJob>, concurrency: usize) {
        let worker = self.clone();
        queue.run_workers(concurrency, move |job| {
            let worker = worker.clone();
            async move { worker.process(job).await }
        });
    }

    async fn process(&self, job: QueuedJob<ResolveJob>) -> Result<()> {
        let source_product_id = job.payload.source_product_id;

        self.store.claim_requests_processing(source_product_id)?;

        let start = Instant::now();
        let outcome = match self
            .resolver
            .resolve(source_product_id, job.payload.trigger)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let kind = self.best_effort_source_kind(source_product_id);
                self.metrics
                    .resolver
                    .record_failure(kind, ReasonCode::SystemError);

                if job.is_final_attempt() {
                    let _ = self
                        .store
                        .fail_requests(source_product_id, &format!("{:#}", e));
                }
                // Otherwise the request stays PROCESSING for the sweeper;
                // rethrow so the queue applies its retry policy.
                return Err(e);
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.record_metrics(&outcome, elapsed_ms);
        self.write_run_log(&job.payload, &outcome, elapsed_ms);

        let persist = !outcome.skipped && outcome.reason_code != Some(ReasonCode::SourceNotFound);
        if persist {
            let mut evidence = outcome.evidence.clone();
            let evidence_json =
                serialize_capped(&mut evidence).context("Failed to serialize evidence")?;

            self.store.upsert_link(&ProductLink {
                source_product_id,
                product_id: outcome.product_id,
                match_type: outcome.match_type,
                status: outcome.status,
                reason_code: outcome.reason_code,
                confidence: outcome.confidence,
                resolver_version: outcome.resolver_version,
                evidence_json,
                resolved_at: now_ts(),
            })?;

            self.store
                .set_source_product_normalized_hash(source_product_id, &outcome.evidence.input_hash)?;
        }

        self.store
            .complete_requests(source_product_id, outcome.product_id)?;

        self.maybe_enqueue_embedding(&outcome, job.payload.trigger);

        Ok(())
    }

    fn record_metrics(&self, outcome: &ResolveOutcome, elapsed_ms: u64) {
        let resolver = &self.metrics.resolver;
        resolver.record_request(outcome.source_kind);
        resolver.latency_ms.record(elapsed_ms);
        resolver.record_decision(outcome.source_kind, outcome.status);
        resolver.record_match_path(outcome.match_path, outcome.status);
        for field in &outcome.missing_fields {
            resolver.record_missing_field(*field);
        }
        if outcome.status == LinkStatus::Error {
            resolver.record_failure(
                outcome.source_kind,
                outcome.reason_code.unwrap_or(ReasonCode::SystemError),
            );
        }
    }

    fn write_run_log(&self, job: &ResolveJob, outcome: &ResolveOutcome, elapsed_ms: u64) {
        let Ok(log) = self.runlog.open_resolver(job.feed_run_id.as_deref()) else {
            return;
        };
        let _ = log.line(&format!(
            "resolve source_product={} status={} match_type={} product={} confidence={:.2} \
             skipped={} relink_blocked={} elapsed_ms={}",
            outcome.source_product_id,
            outcome.status.as_str(),
            outcome.match_type.as_str(),
            outcome
                .product_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            outcome.confidence,
            outcome.skipped,
            outcome.relink_blocked,
            elapsed_ms,
        ));
    }

    fn maybe_enqueue_embedding(&self, outcome: &ResolveOutcome, trigger: ResolveTrigger) {
        if !matches!(outcome.status, LinkStatus::Matched | LinkStatus::Created) {
            return;
        }
        let Some(product_id) = outcome.product_id else {
            return;
        };
        if !self
            .store
            .get_setting_bool(settings_keys::AUTO_EMBEDDING_ENABLED, false)
        {
            return;
        }

        // Embedding generation is isolated from resolution: any problem here
        // is logged and swallowed.
        let enqueued = self.embedding_queue.enqueue(
            format!("EMBED_PRODUCT_{}", product_id),
            EmbeddingJob {
                product_id,
                trigger,
            },
        );
        if !enqueued {
            warn!(product_id, "embedding job already queued, collapsed");
        }
    }

    fn best_effort_source_kind(&self, source_product_id: i64) -> Pipeline {
        self.store
            .get_source_product(source_product_id)
            .ok()
            .flatten()
            .and_then(|sp| self.store.get_source_pipeline(sp.source_id).ok().flatten())
            .unwrap_or(Pipeline::Affiliate)
    }
}

/// Drain `embedding-generate` jobs. Generation itself lives elsewhere; this
/// consumer just acknowledges the event contract.
pub fn spawn_embedding_drain(queue: &JobQueue<EmbeddingJob>) {
    queue.run_workers(1, |job| async move {
        debug!(
            product_id = job.payload.product_id,
            trigger = job.payload.trigger.as_str(),
            "embedding generation event"
        );
        Ok(())
    });
}
