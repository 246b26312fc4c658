//! SQLite-backed persistence for feeds, runs, products and resolver state.
//!
//! Key choices:
//! - WAL mode for concurrent reads during ingest writes
//! - Prepared statement caching on hot paths
//! - Explicit BEGIN IMMEDIATE transactions for multi-row batches
//! - A single connection guarded by a parking_lot mutex; callers never hold
//!   the lock across an await point

mod feed_store;
mod product_store;

pub use feed_store::NewFeed;
pub use product_store::{NewSourceProduct, ProductCreate, ProductFields, UpsertedSourceProduct};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS feeds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    network TEXT NOT NULL,
    retailer_slug TEXT NOT NULL,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    transport TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    remote_path TEXT NOT NULL,
    username TEXT NOT NULL,
    secret_blob TEXT,
    secret_key_id TEXT,
    secret_version INTEGER NOT NULL DEFAULT 0,
    format TEXT NOT NULL DEFAULT 'CSV_V1',
    compression TEXT NOT NULL DEFAULT 'NONE',
    schedule_frequency_hours INTEGER,
    expiry_hours INTEGER NOT NULL DEFAULT 72,
    expiry_block_fraction REAL NOT NULL DEFAULT 0.5,
    max_file_size_bytes INTEGER,
    max_row_count INTEGER,
    next_run_at INTEGER,
    manual_run_pending INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_remote_mtime INTEGER,
    last_remote_size INTEGER,
    last_content_hash TEXT,
    feed_lock_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_feeds_due
    ON feeds(status, next_run_at);

CREATE INDEX IF NOT EXISTS idx_feeds_source
    ON feeds(source_id);

CREATE TABLE IF NOT EXISTS feed_runs (
    id TEXT PRIMARY KEY,
    feed_id INTEGER NOT NULL,
    trigger TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'RUNNING',
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    correlation_id TEXT NOT NULL,
    rows_read INTEGER NOT NULL DEFAULT 0,
    rows_parsed INTEGER NOT NULL DEFAULT 0,
    products_upserted INTEGER NOT NULL DEFAULT 0,
    prices_written INTEGER NOT NULL DEFAULT 0,
    products_promoted INTEGER NOT NULL DEFAULT 0,
    products_rejected INTEGER NOT NULL DEFAULT 0,
    duplicate_key_count INTEGER NOT NULL DEFAULT 0,
    url_hash_fallback_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    failure_kind TEXT,
    failure_code TEXT,
    failure_message TEXT,
    expiry_blocked INTEGER NOT NULL DEFAULT 0,
    expiry_blocked_reason TEXT,
    expiry_approved_at INTEGER,
    expiry_approved_by TEXT,
    ignored_at INTEGER,
    ignored_by TEXT,
    ignored_reason TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_feed_runs_feed
    ON feed_runs(feed_id, started_at DESC);

CREATE INDEX IF NOT EXISTS idx_feed_runs_status
    ON feed_runs(feed_id, status);

CREATE TABLE IF NOT EXISTS feed_run_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_run_id TEXT NOT NULL,
    row_number INTEGER,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_feed_run_errors_run
    ON feed_run_errors(feed_run_id);

CREATE TABLE IF NOT EXISTS source_products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    stable_key TEXT NOT NULL,
    title TEXT NOT NULL,
    brand TEXT,
    url TEXT,
    normalized_url TEXT,
    attributes TEXT,
    caliber TEXT,
    grain_weight INTEGER,
    round_count INTEGER,
    price_cents INTEGER,
    normalized_hash TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(source_id, stable_key)
);

CREATE TABLE IF NOT EXISTS source_product_identifiers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_product_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE(source_product_id, kind)
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_key TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    category TEXT,
    brand TEXT,
    brand_norm TEXT,
    caliber TEXT,
    caliber_norm TEXT,
    grain_weight INTEGER,
    round_count INTEGER,
    upc_norm TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_products_brand_caliber
    ON products(brand_norm, caliber_norm);

CREATE TABLE IF NOT EXISTS product_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_product_id INTEGER NOT NULL UNIQUE,
    to_product_id INTEGER NOT NULL,
    reason TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS product_links (
    source_product_id INTEGER PRIMARY KEY,
    product_id INTEGER,
    match_type TEXT NOT NULL,
    status TEXT NOT NULL,
    reason_code TEXT,
    confidence REAL NOT NULL DEFAULT 0,
    resolver_version INTEGER NOT NULL,
    evidence_json TEXT NOT NULL,
    resolved_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_product_links_product
    ON product_links(product_id);

CREATE TABLE IF NOT EXISTS product_resolve_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    source_product_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    error_message TEXT,
    result_product_id INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_resolve_requests_status
    ON product_resolve_requests(status, updated_at);

CREATE TABLE IF NOT EXISTS source_trust_config (
    source_id INTEGER PRIMARY KEY,
    upc_trusted INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS brand_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_norm TEXT NOT NULL UNIQUE,
    to_norm TEXT NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS source_product_presence (
    source_product_id INTEGER PRIMARY KEY,
    source_id INTEGER NOT NULL,
    last_seen_success_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_presence_source
    ON source_product_presence(source_id, last_seen_success_at);

CREATE TABLE IF NOT EXISTS source_product_seen (
    feed_run_id TEXT NOT NULL,
    source_product_id INTEGER NOT NULL,
    PRIMARY KEY (feed_run_id, source_product_id)
) WITHOUT ROWID;
"#;

/// Shared handle to the catalog database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database and apply the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();

        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Catalog database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Read a settings value.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value)
    }

    /// Upsert a settings value.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Boolean settings are stored as "true"/"false"; absent keys fall back to
    /// the supplied default.
    pub fn get_setting_bool(&self, key: &str, default: bool) -> bool {
        match self.get_setting(key) {
            Ok(Some(v)) => v.eq_ignore_ascii_case("true") || v == "1",
            Ok(None) => default,
            Err(e) => {
                warn!(key = key, error = %e, "failed to read setting, using default");
                default
            }
        }
    }

    pub fn set_setting_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_and_settings_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();

        assert!(store.get_setting("ALLOW_PLAIN_FTP").unwrap().is_none());
        assert!(!store.get_setting_bool("ALLOW_PLAIN_FTP", false));
        assert!(store.get_setting_bool("AFFILIATE_SCHEDULER_ENABLED", true));

        store.set_setting_bool("ALLOW_PLAIN_FTP", true).unwrap();
        assert!(store.get_setting_bool("ALLOW_PLAIN_FTP", false));

        store.set_setting_bool("ALLOW_PLAIN_FTP", false).unwrap();
        assert!(!store.get_setting_bool("ALLOW_PLAIN_FTP", true));
    }
}
