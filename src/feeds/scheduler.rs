//! Feed scheduler: finds due feeds and queues ingest jobs.

use anyhow::Result;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::feeds::ingest::{ingest_job_id, IngestJob, IngestQueues};
use crate::models::{now_ts, settings_keys, Pipeline, RunTrigger};
use crate::store::Store;

/// Outcome of a manual run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualRunOutcome {
    /// No run in flight; the job was queued immediately.
    Enqueued,
    /// A run is in flight; a follow-up will start when it finishes.
    PendingAfterCurrent,
}

pub struct FeedScheduler {
    store: Store,
    ingest_queues: IngestQueues,
    last_tick_at: AtomicI64,
}

impl FeedScheduler {
    pub fn new(store: Store, ingest_queues: IngestQueues) -> Arc<Self> {
        Arc::new(Self {
            store,
            ingest_queues,
            last_tick_at: AtomicI64::new(0),
        })
    }

    /// Unix seconds of the last completed tick, for liveness reporting.
    pub fn last_tick_at(&self) -> i64 {
        self.last_tick_at.load(Ordering::Relaxed)
    }

    /// One scheduling pass. Returns how many ingest jobs were enqueued.
    pub fn tick_once(&self) -> Result<usize> {
        let affiliate_enabled = self
            .store
            .get_setting_bool(settings_keys::AFFILIATE_SCHEDULER_ENABLED, true);
        let harvester_enabled = self
            .store
            .get_setting_bool(settings_keys::HARVESTER_SCHEDULER_ENABLED, true);

        if !affiliate_enabled && !harvester_enabled {
            return Ok(0);
        }

        let due = self.store.list_due_feeds(now_ts())?;
        let mut enqueued = 0usize;

        for feed in due {
            let pipeline_enabled = match feed.pipeline {
                Pipeline::Affiliate => affiliate_enabled,
                Pipeline::Retailer => harvester_enabled,
            };
            if !pipeline_enabled {
                continue;
            }

            // The advisory lock is the real barrier; skipping in-flight feeds
            // here just avoids queueing jobs that would record LOCK_BUSY.
            if self.store.has_in_flight_run(feed.id)? {
                continue;
            }

            if self.ingest_queues.for_pipeline(feed.pipeline).enqueue(
                ingest_job_id(feed.id),
                IngestJob {
                    feed_id: feed.id,
                    trigger: RunTrigger::Scheduled,
                },
            ) {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            debug!(enqueued, "scheduler queued due feeds");
        }
        Ok(enqueued)
    }

    /// Manual fast path: run now if idle, otherwise flag a follow-up.
    pub fn trigger_manual(&self, feed_id: i64) -> Result<ManualRunOutcome> {
        let feed = self
            .store
            .get_feed(feed_id)?
            .ok_or_else(|| anyhow::anyhow!("feed {} not found", feed_id))?;

        if self.store.has_in_flight_run(feed_id)? {
            self.store.set_manual_run_pending(feed_id, true)?;
            return Ok(ManualRunOutcome::PendingAfterCurrent);
        }

        self.ingest_queues.for_pipeline(feed.pipeline).enqueue(
            ingest_job_id(feed_id),
            IngestJob {
                feed_id,
                trigger: RunTrigger::Manual,
            },
        );
        Ok(ManualRunOutcome::Enqueued)
    }

    /// Periodic ticking.
    pub fn spawn(self: &Arc<Self>, tick: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.tick_once() {
                    warn!(error = %e, "scheduler tick failed");
                }
                scheduler.last_tick_at.store(now_ts(), Ordering::Relaxed);
            }
        });
    }
}
