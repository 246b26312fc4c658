//! Feed and feed-run persistence.

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::Store;
use crate::models::{
    Compression, FailureCode, Feed, FeedRun, FeedStatus, Pipeline, RunCounters, RunStatus,
    RunTrigger, TransportKind, now_ts,
};

/// Fields needed to register a feed. Everything else starts at defaults.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub source_id: i64,
    pub network: String,
    pub retailer_slug: String,
    pub pipeline: Pipeline,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub remote_path: String,
    pub username: String,
    pub secret_blob: Option<String>,
    pub secret_key_id: Option<String>,
    pub compression: Compression,
    pub schedule_frequency_hours: Option<i64>,
    pub expiry_hours: i64,
    pub feed_lock_id: i64,
}

fn row_to_feed(row: &Row) -> rusqlite::Result<Feed> {
    let status: String = row.get("status")?;
    let transport: String = row.get("transport")?;
    let compression: String = row.get("compression")?;
    let pipeline: String = row.get("pipeline")?;
    let port: i64 = row.get("port")?;
    let manual_run_pending: i64 = row.get("manual_run_pending")?;
    let max_file_size_bytes: Option<i64> = row.get("max_file_size_bytes")?;
    let max_row_count: Option<i64> = row.get("max_row_count")?;

    Ok(Feed {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        network: row.get("network")?,
        retailer_slug: row.get("retailer_slug")?,
        pipeline: Pipeline::parse(&pipeline).unwrap_or(Pipeline::Affiliate),
        status: FeedStatus::parse(&status).unwrap_or(FeedStatus::Draft),
        transport: TransportKind::parse(&transport).unwrap_or(TransportKind::Sftp),
        host: row.get("host")?,
        port: port as u16,
        remote_path: row.get("remote_path")?,
        username: row.get("username")?,
        secret_blob: row.get("secret_blob")?,
        secret_key_id: row.get("secret_key_id")?,
        secret_version: row.get("secret_version")?,
        compression: Compression::parse(&compression).unwrap_or(Compression::None),
        schedule_frequency_hours: row.get("schedule_frequency_hours")?,
        expiry_hours: row.get("expiry_hours")?,
        expiry_block_fraction: row.get("expiry_block_fraction")?,
        max_file_size_bytes: max_file_size_bytes.map(|v| v as u64),
        max_row_count: max_row_count.map(|v| v as u64),
        next_run_at: row.get("next_run_at")?,
        manual_run_pending: manual_run_pending != 0,
        consecutive_failures: row.get("consecutive_failures")?,
        last_remote_mtime: row.get("last_remote_mtime")?,
        last_remote_size: row.get("last_remote_size")?,
        last_content_hash: row.get("last_content_hash")?,
        feed_lock_id: row.get("feed_lock_id")?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<FeedRun> {
    let trigger: String = row.get("trigger")?;
    let status: String = row.get("status")?;
    let failure_kind: Option<String> = row.get("failure_kind")?;
    let expiry_blocked: i64 = row.get("expiry_blocked")?;

    let get_u64 = |name: &str| -> rusqlite::Result<u64> {
        let v: i64 = row.get(name)?;
        Ok(v.max(0) as u64)
    };

    Ok(FeedRun {
        id: row.get("id")?,
        feed_id: row.get("feed_id")?,
        trigger: RunTrigger::parse(&trigger).unwrap_or(RunTrigger::Scheduled),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Running),
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        correlation_id: row.get("correlation_id")?,
        counters: RunCounters {
            rows_read: get_u64("rows_read")?,
            rows_parsed: get_u64("rows_parsed")?,
            products_upserted: get_u64("products_upserted")?,
            prices_written: get_u64("prices_written")?,
            products_promoted: get_u64("products_promoted")?,
            products_rejected: get_u64("products_rejected")?,
            duplicate_key_count: get_u64("duplicate_key_count")?,
            url_hash_fallback_count: get_u64("url_hash_fallback_count")?,
            error_count: get_u64("error_count")?,
        },
        failure_kind: failure_kind.as_deref().and_then(crate::models::FailureKind::parse),
        failure_code: row.get("failure_code")?,
        failure_message: row.get("failure_message")?,
        expiry_blocked: expiry_blocked != 0,
        expiry_blocked_reason: row.get("expiry_blocked_reason")?,
        expiry_approved_at: row.get("expiry_approved_at")?,
        expiry_approved_by: row.get("expiry_approved_by")?,
        ignored_at: row.get("ignored_at")?,
        ignored_by: row.get("ignored_by")?,
        ignored_reason: row.get("ignored_reason")?,
    })
}

const FEED_COLUMNS: &str = "id, source_id, network, retailer_slug, pipeline, status, transport, \
     host, port, remote_path, username, secret_blob, secret_key_id, secret_version, \
     compression, schedule_frequency_hours, expiry_hours, expiry_block_fraction, \
     max_file_size_bytes, max_row_count, next_run_at, manual_run_pending, \
     consecutive_failures, last_remote_mtime, last_remote_size, last_content_hash, feed_lock_id";

const RUN_COLUMNS: &str = "id, feed_id, trigger, status, started_at, finished_at, correlation_id, \
     rows_read, rows_parsed, products_upserted, prices_written, products_promoted, \
     products_rejected, duplicate_key_count, url_hash_fallback_count, error_count, \
     failure_kind, failure_code, failure_message, expiry_blocked, expiry_blocked_reason, \
     expiry_approved_at, expiry_approved_by, ignored_at, ignored_by, ignored_reason";

impl Store {
    pub fn insert_feed(&self, new: &NewFeed) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO feeds \
             (source_id, network, retailer_slug, pipeline, transport, host, port, remote_path, \
              username, secret_blob, secret_key_id, compression, schedule_frequency_hours, \
              expiry_hours, feed_lock_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                new.source_id,
                new.network,
                new.retailer_slug,
                new.pipeline.as_str(),
                new.transport.as_str(),
                new.host,
                new.port as i64,
                new.remote_path,
                new.username,
                new.secret_blob,
                new.secret_key_id,
                new.compression.as_str(),
                new.schedule_frequency_hours,
                new.expiry_hours,
                new.feed_lock_id,
            ],
        )
        .context("Failed to insert feed")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let conn = self.conn();
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1 LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([feed_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_feed(row)?)),
            None => Ok(None),
        }
    }

    /// Feeds that are ENABLED with a due `next_run_at`.
    pub fn list_due_feeds(&self, now: i64) -> Result<Vec<Feed>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             WHERE status = 'ENABLED' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let feeds = stmt
            .query_map([now], row_to_feed)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(feeds)
    }

    /// The pipeline a given source id feeds into, if the source is known.
    pub fn get_source_pipeline(&self, source_id: i64) -> Result<Option<Pipeline>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT pipeline FROM feeds WHERE source_id = ?1 ORDER BY id LIMIT 1",
        )?;
        let mut rows = stmt.query([source_id])?;
        match rows.next()? {
            Some(row) => {
                let p: String = row.get(0)?;
                Ok(Pipeline::parse(&p))
            }
            None => Ok(None),
        }
    }

    pub fn set_feed_status(&self, feed_id: i64, status: FeedStatus) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET status = ?2, updated_at = strftime('%s','now') WHERE id = ?1",
            params![feed_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_next_run_at(&self, feed_id: i64, next_run_at: Option<i64>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET next_run_at = ?2, updated_at = strftime('%s','now') WHERE id = ?1",
            params![feed_id, next_run_at],
        )?;
        Ok(())
    }

    pub fn set_manual_run_pending(&self, feed_id: i64, pending: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET manual_run_pending = ?2, updated_at = strftime('%s','now') \
             WHERE id = ?1",
            params![feed_id, pending as i64],
        )?;
        Ok(())
    }

    pub fn reset_consecutive_failures(&self, feed_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET consecutive_failures = 0, updated_at = strftime('%s','now') \
             WHERE id = ?1",
            params![feed_id],
        )?;
        Ok(())
    }

    /// Increment the failure streak and return the new count.
    pub fn increment_consecutive_failures(&self, feed_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET consecutive_failures = consecutive_failures + 1, \
             updated_at = strftime('%s','now') WHERE id = ?1",
            params![feed_id],
        )?;
        let count: i64 = conn.query_row(
            "SELECT consecutive_failures FROM feeds WHERE id = ?1",
            [feed_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn update_change_detection(
        &self,
        feed_id: i64,
        mtime: Option<i64>,
        size: Option<i64>,
        content_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feeds SET last_remote_mtime = ?2, last_remote_size = ?3, \
             last_content_hash = ?4, updated_at = strftime('%s','now') WHERE id = ?1",
            params![feed_id, mtime, size, content_hash],
        )?;
        Ok(())
    }

    /// Force-reprocess support: forget everything change detection knows.
    pub fn clear_change_detection(&self, feed_id: i64) -> Result<()> {
        self.update_change_detection(feed_id, None, None, None)
    }

    pub fn has_in_flight_run(&self, feed_id: i64) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_runs WHERE feed_id = ?1 AND status = 'RUNNING'",
            [feed_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Open a run in RUNNING state.
    pub fn create_run(
        &self,
        run_id: &str,
        feed_id: i64,
        trigger: RunTrigger,
        correlation_id: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO feed_runs (id, feed_id, trigger, status, started_at, correlation_id) \
             VALUES (?1, ?2, ?3, 'RUNNING', ?4, ?5)",
            params![run_id, feed_id, trigger.as_str(), now_ts(), correlation_id],
        )
        .context("Failed to create feed run")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<FeedRun>> {
        let conn = self.conn();
        let sql = format!("SELECT {RUN_COLUMNS} FROM feed_runs WHERE id = ?1 LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }

    /// Write the terminal state of a run. Terminal states are write-once:
    /// a run that already left RUNNING is never re-opened or overwritten.
    /// Returns false if the run was no longer RUNNING.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
        failure_code: Option<&str>,
        failure_kind: Option<&str>,
        failure_message: Option<&str>,
        expiry_blocked: bool,
        expiry_blocked_reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE feed_runs SET \
                status = ?2, finished_at = ?3, \
                rows_read = ?4, rows_parsed = ?5, products_upserted = ?6, prices_written = ?7, \
                products_promoted = ?8, products_rejected = ?9, duplicate_key_count = ?10, \
                url_hash_fallback_count = ?11, error_count = ?12, \
                failure_code = ?13, failure_kind = ?14, failure_message = ?15, \
                expiry_blocked = ?16, expiry_blocked_reason = ?17 \
             WHERE id = ?1 AND status = 'RUNNING'",
            params![
                run_id,
                status.as_str(),
                now_ts(),
                counters.rows_read as i64,
                counters.rows_parsed as i64,
                counters.products_upserted as i64,
                counters.prices_written as i64,
                counters.products_promoted as i64,
                counters.products_rejected as i64,
                counters.duplicate_key_count as i64,
                counters.url_hash_fallback_count as i64,
                counters.error_count as i64,
                failure_code,
                failure_kind,
                failure_message,
                expiry_blocked as i64,
                expiry_blocked_reason,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_run_error(
        &self,
        run_id: &str,
        row_number: Option<u64>,
        code: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO feed_run_errors (feed_run_id, row_number, code, message) \
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, row_number.map(|v| v as i64), code, message],
        )?;
        Ok(())
    }

    /// Most recently started run for a feed.
    pub fn latest_run(&self, feed_id: i64) -> Result<Option<FeedRun>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM feed_runs WHERE feed_id = ?1 \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([feed_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }

    /// Whether the feed has ever completed a run successfully.
    pub fn has_successful_run(&self, feed_id: i64) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_runs WHERE feed_id = ?1 AND status = 'SUCCEEDED'",
            [feed_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Admin reset: any RUNNING run becomes FAILED with ADMIN_RESET.
    /// Returns the number of runs closed.
    pub fn fail_running_runs(&self, feed_id: i64, message: &str) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE feed_runs SET status = 'FAILED', finished_at = ?2, \
                failure_kind = 'ADMIN', failure_code = ?3, failure_message = ?4 \
             WHERE feed_id = ?1 AND status = 'RUNNING'",
            params![feed_id, now_ts(), FailureCode::AdminReset.as_str(), message],
        )?;
        Ok(changed)
    }

    /// Is there a SUCCEEDED run for this feed that started after the given run?
    pub fn newer_succeeded_run_exists(&self, feed_id: i64, run_id: &str) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_runs r \
             WHERE r.feed_id = ?1 AND r.status = 'SUCCEEDED' \
               AND r.started_at > (SELECT started_at FROM feed_runs WHERE id = ?2)",
            params![feed_id, run_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record an expiry approval. Write-once: fails to match if already approved.
    pub fn approve_run_expiry(&self, run_id: &str, actor: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE feed_runs SET expiry_approved_at = ?2, expiry_approved_by = ?3 \
             WHERE id = ?1 AND expiry_blocked = 1 AND expiry_approved_at IS NULL",
            params![run_id, now_ts(), actor],
        )?;
        Ok(changed > 0)
    }

    pub fn set_run_promoted_count(&self, run_id: &str, promoted: u64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE feed_runs SET products_promoted = ?2 WHERE id = ?1",
            params![run_id, promoted as i64],
        )?;
        Ok(())
    }

    pub fn ignore_run(&self, run_id: &str, actor: &str, reason: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE feed_runs SET ignored_at = ?2, ignored_by = ?3, ignored_reason = ?4 \
             WHERE id = ?1 AND ignored_at IS NULL",
            params![run_id, now_ts(), actor, reason],
        )?;
        Ok(changed > 0)
    }

    pub fn unignore_run(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE feed_runs SET ignored_at = NULL, ignored_by = NULL, ignored_reason = NULL \
             WHERE id = ?1 AND ignored_at IS NOT NULL",
            params![run_id],
        )?;
        Ok(changed > 0)
    }
}
