//! Recovery of resolve requests stuck in PROCESSING.
//!
//! A request can be stranded when a worker dies mid-job or a system error
//! leaves retries to the queue that never arrive. Every tick the sweeper
//! moves timed-out rows back to PENDING (attempts++) and re-enqueues them
//! with a short delay, or fails them once attempts are exhausted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::jobs::JobQueue;
use crate::models::{now_ts, ResolveTrigger};
use crate::resolver::engine::RESOLVER_VERSION;
use crate::resolver::worker::{resolve_job_id, ResolveJob};
use crate::store::Store;

const STUCK_AFTER: Duration = Duration::from_secs(5 * 60);
const MAX_ATTEMPTS: i64 = 3;
const BATCH_LIMIT: usize = 100;
const REENQUEUE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub requeued: usize,
    pub failed: usize,
}

pub struct StuckJobSweeper {
    store: Store,
    queue: JobQueue<ResolveJob>,
}

impl StuckJobSweeper {
    pub fn new(store: Store, queue: JobQueue<ResolveJob>) -> Arc<Self> {
        Arc::new(Self { store, queue })
    }

    /// One sweep pass over at most `BATCH_LIMIT` stuck requests.
    pub fn sweep_once(&self) -> Result<SweepStats> {
        let cutoff = now_ts() - STUCK_AFTER.as_secs() as i64;
        let stuck = self.store.list_stuck_processing(cutoff, BATCH_LIMIT)?;

        let mut stats = SweepStats::default();
        for request in stuck {
            if request.attempts + 1 >= MAX_ATTEMPTS {
                self.store
                    .sweeper_fail_request(request.id, "Exceeded max attempts")?;
                stats.failed += 1;
                warn!(
                    source_product_id = request.source_product_id,
                    attempts = request.attempts,
                    "stuck resolve request failed permanently"
                );
            } else {
                self.store.sweeper_requeue_request(request.id)?;
                self.queue.enqueue_delayed(
                    resolve_job_id(request.source_product_id),
                    ResolveJob {
                        source_product_id: request.source_product_id,
                        trigger: ResolveTrigger::Reconcile,
                        resolver_version: RESOLVER_VERSION,
                        feed_run_id: None,
                    },
                    REENQUEUE_DELAY,
                );
                stats.requeued += 1;
            }
        }

        if stats.requeued > 0 || stats.failed > 0 {
            info!(
                requeued = stats.requeued,
                failed = stats.failed,
                "swept stuck resolve requests"
            );
        }
        Ok(stats)
    }

    /// Periodic sweeping. Single-flight: the tick interval skips missed
    /// ticks instead of bursting, and sweeps run sequentially on one task.
    pub fn spawn(self: &Arc<Self>, tick: Duration) {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep_once() {
                    warn!(error = %e, "stuck-job sweep failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestStatus;
    use crate::store::NewSourceProduct;
    use rusqlite::params;
    use tempfile::NamedTempFile;

    fn seed_processing_request(store: &Store, spid: i64, attempts: i64, age_secs: i64) {
        store.ensure_pending_request(spid).unwrap();
        store.claim_requests_processing(spid).unwrap();
        // Backdate and set attempts directly.
        let conn = store.conn();
        conn.execute(
            "UPDATE product_resolve_requests SET updated_at = ?2, attempts = ?3 \
             WHERE source_product_id = ?1",
            params![spid, now_ts() - age_secs, attempts],
        )
        .unwrap();
    }

    fn seed_source(store: &Store, key: &str) -> i64 {
        store
            .upsert_source_product(&NewSourceProduct {
                source_id: 1,
                stable_key: key.to_string(),
                title: "Federal 9mm 124gr JHP".to_string(),
                brand: Some("Federal".to_string()),
                url: None,
                normalized_url: None,
                attributes: None,
                caliber: None,
                grain_weight: None,
                round_count: None,
                price_cents: None,
                identifiers: Vec::new(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_requeues_fresh_attempts_and_fails_exhausted() {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let queue: JobQueue<ResolveJob> =
            JobQueue::new("product-resolve", 3, Duration::from_millis(5));
        let sweeper = StuckJobSweeper::new(store.clone(), queue.clone());

        let fresh = seed_source(&store, "SKU-FRESH");
        let exhausted = seed_source(&store, "SKU-DONE");
        seed_processing_request(&store, fresh, 0, 600);
        seed_processing_request(&store, exhausted, 2, 600);

        // A recent PROCESSING row must be left alone.
        let recent = seed_source(&store, "SKU-RECENT");
        seed_processing_request(&store, recent, 0, 10);

        let stats = sweeper.sweep_once().unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.failed, 1);

        let fresh_req = store.get_request(fresh).unwrap().unwrap();
        assert_eq!(fresh_req.status, RequestStatus::Pending);
        assert_eq!(fresh_req.attempts, 1);

        let done_req = store.get_request(exhausted).unwrap().unwrap();
        assert_eq!(done_req.status, RequestStatus::Failed);
        assert_eq!(
            done_req.error_message.as_deref(),
            Some("Exceeded max attempts")
        );

        let recent_req = store.get_request(recent).unwrap().unwrap();
        assert_eq!(recent_req.status, RequestStatus::Processing);

        // The requeued job lands on the queue after its delay.
        for _ in 0..200 {
            if queue.depth() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_when_nothing_stuck() {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let queue: JobQueue<ResolveJob> =
            JobQueue::new("product-resolve", 3, Duration::from_millis(5));
        let sweeper = StuckJobSweeper::new(store, queue);

        assert_eq!(sweeper.sweep_once().unwrap(), SweepStats::default());
    }
}
