//! Per-run log files under the data-feeds log tree.
//!
//! Layout:
//! - `logs/datafeeds/affiliate/<retailer-slug>/<iso-timestamp>.log`
//! - `logs/datafeeds/retailers/<iso-timestamp>.log`
//! - `logs/datafeeds/resolver/<run-id>.log` (or `daily-<YYYY-MM-DD>.log`
//!   when no run id is present)
//!
//! Retention is 7 days; the sweep also removes directories left empty.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Pipeline;

const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Root handle for data-feed log files.
pub struct RunLogger {
    base_dir: PathBuf,
}

impl RunLogger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.into(),
        })
    }

    fn datafeeds_dir(&self) -> PathBuf {
        self.base_dir.join("datafeeds")
    }

    /// Open the log file for one feed ingest run.
    pub fn open_feed_run(&self, pipeline: Pipeline, retailer_slug: &str) -> Result<RunLogFile> {
        let dir = match pipeline {
            Pipeline::Affiliate => self.datafeeds_dir().join("affiliate").join(retailer_slug),
            Pipeline::Retailer => self.datafeeds_dir().join("retailers"),
        };
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        RunLogFile::create(dir, format!("{}.log", stamp))
    }

    /// Open the resolver log for a feed run, or the daily fallback file.
    pub fn open_resolver(&self, feed_run_id: Option<&str>) -> Result<RunLogFile> {
        let dir = self.datafeeds_dir().join("resolver");
        let name = match feed_run_id {
            Some(run_id) => format!("{}.log", run_id),
            None => format!("daily-{}.log", Utc::now().format("%Y-%m-%d")),
        };
        RunLogFile::create(dir, name)
    }

    /// Delete log files older than the retention window and sweep empty
    /// directories.
    pub fn sweep_retention(&self) -> Result<usize> {
        let root = self.datafeeds_dir();
        if !root.exists() {
            return Ok(0);
        }
        let cutoff = std::time::SystemTime::now() - RETENTION;
        let mut removed = 0usize;
        sweep_dir(&root, cutoff, &mut removed)?;
        Ok(removed)
    }

    /// Background retention sweeping.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) {
        let logger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match logger.sweep_retention() {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "swept expired datafeed logs")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "log retention sweep failed"),
                }
            }
        });
    }
}

fn sweep_dir(dir: &Path, cutoff: std::time::SystemTime, removed: &mut usize) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            sweep_dir(&path, cutoff, removed)?;
            // Remove directories the file sweep emptied.
            if fs::read_dir(&path)?.next().is_none() {
                let _ = fs::remove_dir(&path);
            }
        } else if let Ok(meta) = entry.metadata() {
            let expired = meta
                .modified()
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if expired && fs::remove_file(&path).is_ok() {
                *removed += 1;
            }
        }
    }
    Ok(())
}

/// An open, append-only run log.
pub struct RunLogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLogFile {
    fn create(dir: PathBuf, name: String) -> Result<Self> {
        fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Log writes are best-effort; callers
    /// ignore the result on hot paths.
    pub fn line(&self, message: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let mut file = self.file.lock();
        writeln!(file, "[{}] {}", now.to_rfc3339(), message)?;
        Ok(())
    }
}
