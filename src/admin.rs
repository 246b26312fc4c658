//! Admin action surface: the small mutation interface the UI calls.
//!
//! Authorization is presumed external. Every operation returns a
//! `{success, message}` outcome with a short human message; precondition
//! failures are outcomes, not errors.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::feeds::locks::AdvisoryLocks;
use crate::feeds::scheduler::{FeedScheduler, ManualRunOutcome};
use crate::models::{now_ts, FeedStatus, RunStatus};
use crate::resolver::caches::TrustCache;
use crate::store::Store;

const MANUAL_RUN_RATE_LIMIT_SECS: i64 = 5 * 60;
const MAX_NEXT_RUN_AHEAD_SECS: i64 = 7 * 24 * 3600;
const MIN_IGNORE_REASON_LEN: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct AdminActions {
    store: Store,
    locks: Arc<AdvisoryLocks>,
    scheduler: Arc<FeedScheduler>,
    trust_cache: Arc<TrustCache>,
    alias_invalidate_tx: broadcast::Sender<()>,
    manual_run_at: Mutex<HashMap<i64, i64>>,
}

impl AdminActions {
    pub fn new(
        store: Store,
        locks: Arc<AdvisoryLocks>,
        scheduler: Arc<FeedScheduler>,
        trust_cache: Arc<TrustCache>,
        alias_invalidate_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            scheduler,
            trust_cache,
            alias_invalidate_tx,
            manual_run_at: Mutex::new(HashMap::new()),
        })
    }

    pub fn enable_feed(&self, feed_id: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };
        if !matches!(
            feed.status,
            FeedStatus::Draft | FeedStatus::Paused | FeedStatus::Disabled
        ) {
            return Ok(ActionOutcome::fail(format!(
                "feed is {} and cannot be enabled",
                feed.status.as_str()
            )));
        }
        if !feed.credentials_complete() {
            return Ok(ActionOutcome::fail(
                "feed credentials are incomplete, cannot enable",
            ));
        }

        self.store.set_feed_status(feed_id, FeedStatus::Enabled)?;
        self.store.reset_consecutive_failures(feed_id)?;
        if feed.schedule_frequency_hours.is_some() {
            // Due immediately; the regular cadence resumes after the first run.
            self.store.set_next_run_at(feed_id, Some(now_ts()))?;
        }
        info!(feed_id, "feed enabled");
        Ok(ActionOutcome::ok("feed enabled"))
    }

    pub fn pause_feed(&self, feed_id: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };
        if feed.status != FeedStatus::Enabled {
            return Ok(ActionOutcome::fail(format!(
                "feed is {} and cannot be paused",
                feed.status.as_str()
            )));
        }

        self.store.set_feed_status(feed_id, FeedStatus::Paused)?;
        self.store.set_next_run_at(feed_id, None)?;
        info!(feed_id, "feed paused");
        Ok(ActionOutcome::ok("feed paused"))
    }

    pub fn reenable_feed(&self, feed_id: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };
        if !matches!(feed.status, FeedStatus::Paused | FeedStatus::Disabled) {
            return Ok(ActionOutcome::fail(format!(
                "feed is {} and cannot be re-enabled",
                feed.status.as_str()
            )));
        }

        self.store.set_feed_status(feed_id, FeedStatus::Enabled)?;
        self.store.reset_consecutive_failures(feed_id)?;
        if feed.schedule_frequency_hours.is_some() {
            self.store.set_next_run_at(feed_id, Some(now_ts()))?;
        }
        info!(feed_id, "feed re-enabled");
        Ok(ActionOutcome::ok("feed re-enabled"))
    }

    pub fn trigger_manual_run(&self, feed_id: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };
        if feed.status == FeedStatus::Draft {
            return Ok(ActionOutcome::fail("draft feeds cannot be run manually"));
        }

        {
            let mut last_runs = self.manual_run_at.lock();
            let now = now_ts();
            if let Some(last) = last_runs.get(&feed_id) {
                let wait = MANUAL_RUN_RATE_LIMIT_SECS - (now - last);
                if wait > 0 {
                    return Ok(ActionOutcome::fail(format!(
                        "manual refresh rate limited, retry in {}s",
                        wait
                    )));
                }
            }
            last_runs.insert(feed_id, now);
        }

        match self.scheduler.trigger_manual(feed_id)? {
            ManualRunOutcome::Enqueued => Ok(ActionOutcome::ok("manual run queued")),
            ManualRunOutcome::PendingAfterCurrent => Ok(ActionOutcome::ok(
                "a run is in flight; manual run will follow it",
            )),
        }
    }

    pub fn update_next_run_at(&self, feed_id: i64, next_run_at: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };
        if feed.status != FeedStatus::Enabled {
            return Ok(ActionOutcome::fail("feed must be ENABLED"));
        }
        let now = now_ts();
        if next_run_at <= now || next_run_at > now + MAX_NEXT_RUN_AHEAD_SECS {
            return Ok(ActionOutcome::fail(
                "next run must be in the future and within 7 days",
            ));
        }

        self.store.set_next_run_at(feed_id, Some(next_run_at))?;
        Ok(ActionOutcome::ok("next run time updated"))
    }

    pub fn reset_feed_state(&self, feed_id: i64) -> Result<ActionOutcome> {
        let Some(feed) = self.store.get_feed(feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };

        let closed = self
            .store
            .fail_running_runs(feed_id, "reset by administrator")?;
        self.store.set_manual_run_pending(feed_id, false)?;
        self.store.reset_consecutive_failures(feed_id)?;
        if feed.status == FeedStatus::Enabled {
            if let Some(hours) = feed.schedule_frequency_hours {
                self.store
                    .set_next_run_at(feed_id, Some(now_ts() + hours * 3600))?;
            }
        }

        info!(feed_id, closed_runs = closed, "feed state reset");
        Ok(ActionOutcome::ok(format!(
            "feed state reset, {} running run(s) marked failed",
            closed
        )))
    }

    pub fn force_reprocess(&self, feed_id: i64) -> Result<ActionOutcome> {
        if self.store.get_feed(feed_id)?.is_none() {
            return Ok(ActionOutcome::fail("feed not found"));
        }
        self.store.clear_change_detection(feed_id)?;
        info!(feed_id, "change detection state cleared");
        Ok(ActionOutcome::ok(
            "change detection cleared; next run reprocesses the file",
        ))
    }

    /// Approve an expiry-blocked run and promote its seen set. Takes the
    /// feed's advisory lock to exclude a concurrent ingest promotion.
    pub fn approve_activation(&self, run_id: &str, actor: &str) -> Result<ActionOutcome> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(ActionOutcome::fail("run not found"));
        };
        if !run.expiry_blocked {
            return Ok(ActionOutcome::fail("run is not expiry-blocked"));
        }
        if run.expiry_approved_at.is_some() {
            return Ok(ActionOutcome::fail("run is already approved"));
        }
        if self.store.newer_succeeded_run_exists(run.feed_id, run_id)? {
            return Ok(ActionOutcome::fail(
                "a newer successful run exists; approve that one instead",
            ));
        }
        let Some(feed) = self.store.get_feed(run.feed_id)? else {
            return Ok(ActionOutcome::fail("feed not found"));
        };

        let Some(_guard) = self.locks.try_lock(feed.feed_lock_id) else {
            return Ok(ActionOutcome::fail(
                "feed is busy with a run; retry once it finishes",
            ));
        };

        if !self.store.approve_run_expiry(run_id, actor)? {
            return Ok(ActionOutcome::fail("run is already approved"));
        }
        let promoted = self.store.promote_seen_set(run_id, now_ts())?;
        self.store.set_run_promoted_count(run_id, promoted)?;

        info!(run_id, actor, promoted, "expiry-blocked run approved");
        Ok(ActionOutcome::ok(format!(
            "approved; {} products promoted",
            promoted
        )))
    }

    pub fn ignore_run(&self, run_id: &str, actor: &str, reason: &str) -> Result<ActionOutcome> {
        if reason.trim().len() < MIN_IGNORE_REASON_LEN {
            return Ok(ActionOutcome::fail("a reason of at least 3 characters is required"));
        }
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(ActionOutcome::fail("run not found"));
        };
        if run.status == RunStatus::Running {
            return Ok(ActionOutcome::fail("running runs cannot be ignored"));
        }

        if self.store.ignore_run(run_id, actor, reason.trim())? {
            Ok(ActionOutcome::ok("run ignored"))
        } else {
            Ok(ActionOutcome::fail("run is already ignored"))
        }
    }

    pub fn unignore_run(&self, run_id: &str) -> Result<ActionOutcome> {
        if self.store.get_run(run_id)?.is_none() {
            return Ok(ActionOutcome::fail("run not found"));
        }
        if self.store.unignore_run(run_id)? {
            Ok(ActionOutcome::ok("run unignored"))
        } else {
            Ok(ActionOutcome::fail("run is not ignored"))
        }
    }

    pub fn update_source_trust_config(
        &self,
        source_id: i64,
        upc_trusted: bool,
    ) -> Result<ActionOutcome> {
        let version = self.store.upsert_trust_config(source_id, upc_trusted)?;
        self.trust_cache.invalidate(source_id);
        info!(source_id, upc_trusted, version, "trust config updated");
        Ok(ActionOutcome::ok(format!(
            "trust config updated to version {}",
            version
        )))
    }

    /// Clear the trust cache outright (admin escape hatch).
    pub fn clear_trust_cache(&self) -> ActionOutcome {
        self.trust_cache.clear();
        ActionOutcome::ok("trust cache cleared")
    }

    /// Ask every alias cache holder to rebuild.
    pub fn invalidate_brand_aliases(&self) -> ActionOutcome {
        let _ = self.alias_invalidate_tx.send(());
        ActionOutcome::ok("brand alias caches invalidated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::ingest::IngestQueues;
    use crate::models::{Compression, Pipeline, RunCounters, RunTrigger, TransportKind};
    use crate::store::NewFeed;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Harness {
        store: Store,
        admin: Arc<AdminActions>,
        _temp: NamedTempFile,
    }

    fn harness() -> Harness {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let queues = IngestQueues::new(1, Duration::from_millis(5));
        let scheduler = FeedScheduler::new(store.clone(), queues);
        let locks = AdvisoryLocks::new();
        let trust_cache = TrustCache::new(store.clone());
        let (alias_tx, _) = broadcast::channel(8);
        let admin = AdminActions::new(store.clone(), locks, scheduler, trust_cache, alias_tx);
        Harness {
            store,
            admin,
            _temp: temp,
        }
    }

    fn insert_feed(store: &Store, source_id: i64, secret: Option<&str>) -> i64 {
        store
            .insert_feed(&NewFeed {
                source_id,
                network: "avantlink".to_string(),
                retailer_slug: "shop".to_string(),
                pipeline: Pipeline::Affiliate,
                transport: TransportKind::Sftp,
                host: "feeds.example.com".to_string(),
                port: 22,
                remote_path: "/export.csv".to_string(),
                username: "scout".to_string(),
                secret_blob: secret.map(str::to_string),
                secret_key_id: None,
                compression: Compression::None,
                schedule_frequency_hours: Some(24),
                expiry_hours: 72,
                feed_lock_id: 8000 + source_id,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_enable_requires_credentials() {
        let h = harness();
        let incomplete = insert_feed(&h.store, 1, None);
        let outcome = h.admin.enable_feed(incomplete).unwrap();
        assert!(!outcome.success);

        let complete = insert_feed(&h.store, 2, Some("c2VjcmV0"));
        let outcome = h.admin.enable_feed(complete).unwrap();
        assert!(outcome.success);

        let feed = h.store.get_feed(complete).unwrap().unwrap();
        assert_eq!(feed.status, FeedStatus::Enabled);
        assert!(feed.next_run_at.is_some());

        // Enabling an already-enabled feed is a precondition failure.
        let outcome = h.admin.enable_feed(complete).unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_pause_and_reenable() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 3, Some("c2VjcmV0"));
        h.admin.enable_feed(feed_id).unwrap();

        assert!(h.admin.pause_feed(feed_id).unwrap().success);
        let feed = h.store.get_feed(feed_id).unwrap().unwrap();
        assert_eq!(feed.status, FeedStatus::Paused);
        assert!(feed.next_run_at.is_none());

        assert!(!h.admin.pause_feed(feed_id).unwrap().success);
        assert!(h.admin.reenable_feed(feed_id).unwrap().success);
        let feed = h.store.get_feed(feed_id).unwrap().unwrap();
        assert_eq!(feed.status, FeedStatus::Enabled);
    }

    #[tokio::test]
    async fn test_manual_run_rate_limit() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 4, Some("c2VjcmV0"));
        h.admin.enable_feed(feed_id).unwrap();

        assert!(h.admin.trigger_manual_run(feed_id).unwrap().success);
        let limited = h.admin.trigger_manual_run(feed_id).unwrap();
        assert!(!limited.success);
        assert!(limited.message.contains("rate limited"));
    }

    #[tokio::test]
    async fn test_update_next_run_at_window() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 5, Some("c2VjcmV0"));
        h.admin.enable_feed(feed_id).unwrap();

        let now = now_ts();
        assert!(!h.admin.update_next_run_at(feed_id, now - 10).unwrap().success);
        assert!(
            !h.admin
                .update_next_run_at(feed_id, now + 8 * 24 * 3600)
                .unwrap()
                .success
        );
        assert!(h.admin.update_next_run_at(feed_id, now + 3600).unwrap().success);
    }

    #[tokio::test]
    async fn test_reset_feed_state_fails_running_runs() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 6, Some("c2VjcmV0"));
        h.admin.enable_feed(feed_id).unwrap();
        h.store
            .create_run("run-hung", feed_id, RunTrigger::Scheduled, "corr")
            .unwrap();
        h.store.set_manual_run_pending(feed_id, true).unwrap();

        let outcome = h.admin.reset_feed_state(feed_id).unwrap();
        assert!(outcome.success);

        let run = h.store.get_run("run-hung").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_code.as_deref(), Some("ADMIN_RESET"));

        let feed = h.store.get_feed(feed_id).unwrap().unwrap();
        assert!(!feed.manual_run_pending);
        assert_eq!(feed.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_approve_activation_flow() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 7, Some("c2VjcmV0"));
        h.store
            .create_run("run-blocked", feed_id, RunTrigger::Scheduled, "corr")
            .unwrap();
        h.store
            .finalize_run(
                "run-blocked",
                RunStatus::Succeeded,
                &RunCounters::default(),
                Some("CIRCUIT_OPEN"),
                Some("CIRCUIT"),
                Some("would expire too much"),
                true,
                Some("would expire too much"),
            )
            .unwrap();

        let outcome = h.admin.approve_activation("run-blocked", "ops").unwrap();
        assert!(outcome.success);

        let run = h.store.get_run("run-blocked").unwrap().unwrap();
        assert_eq!(run.expiry_approved_by.as_deref(), Some("ops"));

        // Approving twice fails the precondition.
        let outcome = h.admin.approve_activation("run-blocked", "ops").unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_ignore_requires_reason() {
        let h = harness();
        let feed_id = insert_feed(&h.store, 8, Some("c2VjcmV0"));
        h.store
            .create_run("run-x", feed_id, RunTrigger::Scheduled, "corr")
            .unwrap();
        h.store
            .finalize_run(
                "run-x",
                RunStatus::Failed,
                &RunCounters::default(),
                Some("TIMEOUT"),
                Some("TRANSPORT"),
                Some("timed out"),
                false,
                None,
            )
            .unwrap();

        assert!(!h.admin.ignore_run("run-x", "ops", "no").unwrap().success);
        assert!(h.admin.ignore_run("run-x", "ops", "bad file").unwrap().success);
        assert!(h.admin.unignore_run("run-x").unwrap().success);
    }

    #[tokio::test]
    async fn test_trust_config_update_invalidates_cache() {
        let h = harness();
        let outcome = h.admin.update_source_trust_config(99, true).unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("version 1"));

        let cfg = h.store.get_trust_config(99).unwrap();
        assert!(cfg.upc_trusted);
    }
}
