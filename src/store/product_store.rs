//! Source product, canonical product and resolver-state persistence.

use anyhow::{Context, Result};
use rusqlite::{params, ErrorCode, Row};

use super::Store;
use crate::models::{
    now_ts, BrandAlias, IdentifierKind, LinkStatus, MatchType, Product, ProductLink,
    RequestStatus, ResolveRequest, TrustConfig,
};

/// One parsed feed row ready for upsert.
#[derive(Debug, Clone)]
pub struct NewSourceProduct {
    pub source_id: i64,
    pub stable_key: String,
    pub title: String,
    pub brand: Option<String>,
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub attributes: Option<String>,
    pub caliber: Option<String>,
    pub grain_weight: Option<u32>,
    pub round_count: Option<u32>,
    pub price_cents: Option<i64>,
    pub identifiers: Vec<(IdentifierKind, String)>,
}

/// Result of a source-product upsert.
#[derive(Debug, Clone, Copy)]
pub struct UpsertedSourceProduct {
    pub id: i64,
    pub created: bool,
    pub price_written: bool,
}

/// Canonical product creation outcome. `Raced` means another writer created
/// the same canonical key first and we re-read the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductCreate {
    Created(i64),
    Raced(i64),
}

impl ProductCreate {
    pub fn product_id(&self) -> i64 {
        match self {
            ProductCreate::Created(id) | ProductCreate::Raced(id) => *id,
        }
    }
}

/// Fields for a new canonical product.
#[derive(Debug, Clone)]
pub struct ProductFields {
    pub canonical_key: String,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub brand_norm: Option<String>,
    pub caliber: Option<String>,
    pub caliber_norm: Option<String>,
    pub grain_weight: Option<u32>,
    pub round_count: Option<u32>,
    pub upc_norm: Option<String>,
}

fn row_to_product(row: &Row) -> rusqlite::Result<Product> {
    let grain: Option<i64> = row.get("grain_weight")?;
    let rounds: Option<i64> = row.get("round_count")?;
    Ok(Product {
        id: row.get("id")?,
        canonical_key: row.get("canonical_key")?,
        name: row.get("name")?,
        category: row.get("category")?,
        brand: row.get("brand")?,
        brand_norm: row.get("brand_norm")?,
        caliber: row.get("caliber")?,
        caliber_norm: row.get("caliber_norm")?,
        grain_weight: grain.map(|v| v as u32),
        round_count: rounds.map(|v| v as u32),
        upc_norm: row.get("upc_norm")?,
    })
}

fn row_to_request(row: &Row) -> rusqlite::Result<ResolveRequest> {
    let status: String = row.get("status")?;
    Ok(ResolveRequest {
        id: row.get("id")?,
        idempotency_key: row.get("idempotency_key")?,
        source_product_id: row.get("source_product_id")?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Pending),
        attempts: row.get("attempts")?,
        last_attempt_at: row.get("last_attempt_at")?,
        error_message: row.get("error_message")?,
        result_product_id: row.get("result_product_id")?,
        updated_at: row.get("updated_at")?,
    })
}

const PRODUCT_COLUMNS: &str = "id, canonical_key, name, category, brand, brand_norm, caliber, \
     caliber_norm, grain_weight, round_count, upc_norm";

/// Idempotency key for the single resolve request of a source product.
pub fn resolve_idempotency_key(source_product_id: i64) -> String {
    format!("RESOLVE_SOURCE_PRODUCT_{}", source_product_id)
}

impl Store {
    /// Upsert one feed row by (source_id, stable_key). Identifier rows are
    /// replaced wholesale; the row's price is written when present.
    pub fn upsert_source_product(&self, new: &NewSourceProduct) -> Result<UpsertedSourceProduct> {
        let conn = self.conn();

        let existing: Option<i64> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM source_products WHERE source_id = ?1 AND stable_key = ?2 LIMIT 1",
            )?;
            let mut rows = stmt.query(params![new.source_id, new.stable_key])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        let (id, created) = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE source_products SET \
                        title = ?2, brand = ?3, url = ?4, normalized_url = ?5, attributes = ?6, \
                        caliber = ?7, grain_weight = ?8, round_count = ?9, \
                        price_cents = COALESCE(?10, price_cents), \
                        updated_at = strftime('%s','now') \
                     WHERE id = ?1",
                    params![
                        id,
                        new.title,
                        new.brand,
                        new.url,
                        new.normalized_url,
                        new.attributes,
                        new.caliber,
                        new.grain_weight.map(|v| v as i64),
                        new.round_count.map(|v| v as i64),
                        new.price_cents,
                    ],
                )
                .context("Failed to update source product")?;
                (id, false)
            }
            None => {
                conn.execute(
                    "INSERT INTO source_products \
                     (source_id, stable_key, title, brand, url, normalized_url, attributes, \
                      caliber, grain_weight, round_count, price_cents) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        new.source_id,
                        new.stable_key,
                        new.title,
                        new.brand,
                        new.url,
                        new.normalized_url,
                        new.attributes,
                        new.caliber,
                        new.grain_weight.map(|v| v as i64),
                        new.round_count.map(|v| v as i64),
                        new.price_cents,
                    ],
                )
                .context("Failed to insert source product")?;
                (conn.last_insert_rowid(), true)
            }
        };

        for (kind, value) in &new.identifiers {
            conn.execute(
                "INSERT INTO source_product_identifiers (source_product_id, kind, value) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(source_product_id, kind) DO UPDATE SET value = excluded.value",
                params![id, kind.as_str(), value],
            )?;
        }

        Ok(UpsertedSourceProduct {
            id,
            created,
            price_written: new.price_cents.is_some(),
        })
    }

    pub fn get_source_product(
        &self,
        source_product_id: i64,
    ) -> Result<Option<crate::models::SourceProduct>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, source_id, stable_key, title, brand, url, normalized_url, attributes, \
                    caliber, grain_weight, round_count, price_cents, normalized_hash \
             FROM source_products WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([source_product_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let grain: Option<i64> = row.get("grain_weight")?;
        let rounds: Option<i64> = row.get("round_count")?;
        let mut product = crate::models::SourceProduct {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            stable_key: row.get("stable_key")?,
            title: row.get("title")?,
            brand: row.get("brand")?,
            url: row.get("url")?,
            normalized_url: row.get("normalized_url")?,
            attributes: row.get("attributes")?,
            caliber: row.get("caliber")?,
            grain_weight: grain.map(|v| v as u32),
            round_count: rounds.map(|v| v as u32),
            price_cents: row.get("price_cents")?,
            normalized_hash: row.get("normalized_hash")?,
            identifiers: Vec::new(),
        };
        drop(rows);
        drop(stmt);

        let mut stmt = conn.prepare_cached(
            "SELECT kind, value FROM source_product_identifiers \
             WHERE source_product_id = ?1 ORDER BY kind",
        )?;
        let idents = stmt
            .query_map([source_product_id], |row| {
                let kind: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((kind, value))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(k, v)| IdentifierKind::parse(&k).map(|kind| (kind, v)))
            .collect();
        product.identifiers = idents;

        Ok(Some(product))
    }

    pub fn set_source_product_normalized_hash(
        &self,
        source_product_id: i64,
        hash: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE source_products SET normalized_hash = ?2, updated_at = strftime('%s','now') \
             WHERE id = ?1",
            params![source_product_id, hash],
        )?;
        Ok(())
    }

    pub fn get_product(&self, product_id: i64) -> Result<Option<Product>> {
        let conn = self.conn();
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1 LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([product_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_product(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_product_by_canonical_key(&self, canonical_key: &str) -> Result<Option<Product>> {
        let conn = self.conn();
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE canonical_key = ?1 LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([canonical_key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_product(row)?)),
            None => Ok(None),
        }
    }

    /// Create a canonical product. On a unique-violation race the winner is
    /// re-read and returned as `Raced`.
    pub fn insert_product(&self, fields: &ProductFields) -> Result<ProductCreate> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO products \
             (canonical_key, name, category, brand, brand_norm, caliber, caliber_norm, \
              grain_weight, round_count, upc_norm) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                fields.canonical_key,
                fields.name,
                fields.category,
                fields.brand,
                fields.brand_norm,
                fields.caliber,
                fields.caliber_norm,
                fields.grain_weight.map(|v| v as i64),
                fields.round_count.map(|v| v as i64),
                fields.upc_norm,
            ],
        );

        match inserted {
            Ok(_) => Ok(ProductCreate::Created(conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                let id: i64 = conn
                    .query_row(
                        "SELECT id FROM products WHERE canonical_key = ?1",
                        [&fields.canonical_key],
                        |row| row.get(0),
                    )
                    .context("Product create raced but winner not found")?;
                Ok(ProductCreate::Raced(id))
            }
            Err(e) => Err(e).context("Failed to insert product"),
        }
    }

    /// Fuzzy candidate pool, bounded. Callers pass limit+1 to detect overflow.
    pub fn find_candidates(
        &self,
        brand_norm: &str,
        caliber_norm: &str,
        limit: usize,
    ) -> Result<Vec<Product>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE brand_norm = ?1 AND caliber_norm = ?2 \
             ORDER BY id LIMIT ?3"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let products = stmt
            .query_map(params![brand_norm, caliber_norm, limit as i64], row_to_product)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(products)
    }

    /// One hop of the alias graph.
    pub fn get_alias_target(&self, from_product_id: i64) -> Result<Option<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT to_product_id FROM product_aliases WHERE from_product_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([from_product_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn insert_product_alias(
        &self,
        from_product_id: i64,
        to_product_id: i64,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO product_aliases (from_product_id, to_product_id, reason) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(from_product_id) DO UPDATE SET \
                to_product_id = excluded.to_product_id, reason = excluded.reason",
            params![from_product_id, to_product_id, reason],
        )?;
        Ok(())
    }

    pub fn get_link(&self, source_product_id: i64) -> Result<Option<ProductLink>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT source_product_id, product_id, match_type, status, reason_code, confidence, \
                    resolver_version, evidence_json, resolved_at \
             FROM product_links WHERE source_product_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([source_product_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let match_type: String = row.get("match_type")?;
        let status: String = row.get("status")?;
        let reason: Option<String> = row.get("reason_code")?;
        let resolver_version: i64 = row.get("resolver_version")?;

        Ok(Some(ProductLink {
            source_product_id: row.get("source_product_id")?,
            product_id: row.get("product_id")?,
            match_type: MatchType::parse(&match_type).unwrap_or(MatchType::None),
            status: LinkStatus::parse(&status).unwrap_or(LinkStatus::Error),
            reason_code: reason.as_deref().and_then(crate::models::ReasonCode::parse),
            confidence: row.get("confidence")?,
            resolver_version: resolver_version as u32,
            evidence_json: row.get("evidence_json")?,
            resolved_at: row.get("resolved_at")?,
        }))
    }

    /// Persist a resolver decision, keyed by source product.
    pub fn upsert_link(&self, link: &ProductLink) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO product_links \
             (source_product_id, product_id, match_type, status, reason_code, confidence, \
              resolver_version, evidence_json, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(source_product_id) DO UPDATE SET \
                product_id = excluded.product_id, \
                match_type = excluded.match_type, \
                status = excluded.status, \
                reason_code = excluded.reason_code, \
                confidence = excluded.confidence, \
                resolver_version = excluded.resolver_version, \
                evidence_json = excluded.evidence_json, \
                resolved_at = excluded.resolved_at",
            params![
                link.source_product_id,
                link.product_id,
                link.match_type.as_str(),
                link.status.as_str(),
                link.reason_code.map(|r| r.as_str()),
                link.confidence,
                link.resolver_version as i64,
                link.evidence_json,
                link.resolved_at,
            ],
        )
        .context("Failed to upsert product link")?;
        Ok(())
    }

    /// Ensure a single open resolve request exists for the source product.
    /// Completed/failed rows are recycled back to PENDING; open rows are
    /// left untouched.
    pub fn ensure_pending_request(&self, source_product_id: i64) -> Result<()> {
        let conn = self.conn();
        let key = resolve_idempotency_key(source_product_id);
        conn.execute(
            "INSERT INTO product_resolve_requests \
             (idempotency_key, source_product_id, status, updated_at) \
             VALUES (?1, ?2, 'PENDING', strftime('%s','now')) \
             ON CONFLICT(idempotency_key) DO UPDATE SET \
                status = CASE WHEN status IN ('COMPLETED','FAILED') THEN 'PENDING' ELSE status END, \
                attempts = CASE WHEN status IN ('COMPLETED','FAILED') THEN 0 ELSE attempts END, \
                error_message = NULL, \
                updated_at = strftime('%s','now')",
            params![key, source_product_id],
        )?;
        Ok(())
    }

    /// PENDING -> PROCESSING for the source product's open request.
    /// Returns how many rows transitioned.
    pub fn claim_requests_processing(&self, source_product_id: i64) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE product_resolve_requests SET \
                status = 'PROCESSING', last_attempt_at = ?2, updated_at = ?2 \
             WHERE source_product_id = ?1 AND status = 'PENDING'",
            params![source_product_id, now_ts()],
        )?;
        Ok(changed)
    }

    /// PROCESSING -> COMPLETED with the resolved product id.
    pub fn complete_requests(
        &self,
        source_product_id: i64,
        result_product_id: Option<i64>,
    ) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE product_resolve_requests SET \
                status = 'COMPLETED', result_product_id = ?2, updated_at = ?3 \
             WHERE source_product_id = ?1 AND status = 'PROCESSING'",
            params![source_product_id, result_product_id, now_ts()],
        )?;
        Ok(changed)
    }

    /// Terminal failure of the open request.
    pub fn fail_requests(&self, source_product_id: i64, message: &str) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE product_resolve_requests SET \
                status = 'FAILED', error_message = ?2, updated_at = ?3 \
             WHERE source_product_id = ?1 AND status = 'PROCESSING'",
            params![source_product_id, message, now_ts()],
        )?;
        Ok(changed)
    }

    /// Requests stuck in PROCESSING since before the cutoff.
    pub fn list_stuck_processing(&self, cutoff: i64, limit: usize) -> Result<Vec<ResolveRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, idempotency_key, source_product_id, status, attempts, last_attempt_at, \
                    error_message, result_product_id, updated_at \
             FROM product_resolve_requests \
             WHERE status = 'PROCESSING' AND updated_at < ?1 \
             ORDER BY updated_at LIMIT ?2",
        )?;
        let requests = stmt
            .query_map(params![cutoff, limit as i64], row_to_request)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(requests)
    }

    /// Sweeper recovery: back to PENDING with attempts incremented.
    pub fn sweeper_requeue_request(&self, request_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE product_resolve_requests SET \
                status = 'PENDING', attempts = attempts + 1, updated_at = ?2 \
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![request_id, now_ts()],
        )?;
        Ok(())
    }

    /// Sweeper giving up on a request.
    pub fn sweeper_fail_request(&self, request_id: i64, message: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE product_resolve_requests SET \
                status = 'FAILED', error_message = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![request_id, message, now_ts()],
        )?;
        Ok(())
    }

    pub fn get_request(&self, source_product_id: i64) -> Result<Option<ResolveRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, idempotency_key, source_product_id, status, attempts, last_attempt_at, \
                    error_message, result_product_id, updated_at \
             FROM product_resolve_requests WHERE source_product_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([source_product_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_request(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_trust_config(&self, source_id: i64) -> Result<TrustConfig> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT source_id, upc_trusted, version FROM source_trust_config \
             WHERE source_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([source_id])?;
        match rows.next()? {
            Some(row) => {
                let trusted: i64 = row.get(1)?;
                Ok(TrustConfig {
                    source_id: row.get(0)?,
                    upc_trusted: trusted != 0,
                    version: row.get(2)?,
                })
            }
            None => Ok(TrustConfig::absent(source_id)),
        }
    }

    /// Upsert trust config, bumping the version. Returns the new version.
    pub fn upsert_trust_config(&self, source_id: i64, upc_trusted: bool) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO source_trust_config (source_id, upc_trusted, version, updated_at) \
             VALUES (?1, ?2, 1, strftime('%s','now')) \
             ON CONFLICT(source_id) DO UPDATE SET \
                upc_trusted = excluded.upc_trusted, \
                version = version + 1, \
                updated_at = excluded.updated_at",
            params![source_id, upc_trusted as i64],
        )?;
        let version: i64 = conn.query_row(
            "SELECT version FROM source_trust_config WHERE source_id = ?1",
            [source_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn list_brand_aliases(&self) -> Result<Vec<BrandAlias>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT id, from_norm, to_norm FROM brand_aliases ORDER BY id")?;
        let aliases = stmt
            .query_map([], |row| {
                Ok(BrandAlias {
                    id: row.get(0)?,
                    from_norm: row.get(1)?,
                    to_norm: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(aliases)
    }

    pub fn insert_brand_alias(&self, from_norm: &str, to_norm: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO brand_aliases (from_norm, to_norm) VALUES (?1, ?2) \
             ON CONFLICT(from_norm) DO UPDATE SET to_norm = excluded.to_norm",
            params![from_norm, to_norm],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM brand_aliases WHERE from_norm = ?1",
            [from_norm],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Fire-and-forget hit accounting; callers swallow errors.
    pub fn bump_brand_alias_hit(&self, alias_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE brand_aliases SET hit_count = hit_count + 1 WHERE id = ?1",
            params![alias_id],
        )?;
        Ok(())
    }

    /// Record that a source product appeared in a run (the run's seen set).
    pub fn record_seen(&self, feed_run_id: &str, source_product_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO source_product_seen (feed_run_id, source_product_id) \
             VALUES (?1, ?2)",
            params![feed_run_id, source_product_id],
        )?;
        Ok(())
    }

    /// Promote a run's seen set: every member's presence row gets
    /// `last_seen_success_at = now`. Returns the number of products promoted.
    pub fn promote_seen_set(&self, feed_run_id: &str, now: i64) -> Result<u64> {
        let conn = self.conn();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let promoted = conn.execute(
            "INSERT INTO source_product_presence (source_product_id, source_id, last_seen_success_at) \
             SELECT s.source_product_id, sp.source_id, ?2 \
             FROM source_product_seen s \
             JOIN source_products sp ON sp.id = s.source_product_id \
             WHERE s.feed_run_id = ?1 \
             ON CONFLICT(source_product_id) DO UPDATE SET \
                last_seen_success_at = excluded.last_seen_success_at",
            params![feed_run_id, now],
        )?;
        conn.execute("COMMIT", [])?;
        Ok(promoted as u64)
    }

    /// Products of this source considered active: last promoted within the
    /// expiry window ending at `active_cutoff`.
    pub fn count_active_products(&self, source_id: i64, active_cutoff: i64) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_product_presence \
             WHERE source_id = ?1 AND last_seen_success_at >= ?2",
            params![source_id, active_cutoff],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Active products of this source that the given run did NOT see; these
    /// are the ones a promotion would expire.
    pub fn count_active_unseen(
        &self,
        source_id: i64,
        feed_run_id: &str,
        active_cutoff: i64,
    ) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_product_presence p \
             WHERE p.source_id = ?1 AND p.last_seen_success_at >= ?3 \
               AND p.source_product_id NOT IN \
                   (SELECT source_product_id FROM source_product_seen WHERE feed_run_id = ?2)",
            params![source_id, feed_run_id, active_cutoff],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_store() -> (Store, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        (store, temp)
    }

    fn sample_row(source_id: i64, key: &str) -> NewSourceProduct {
        NewSourceProduct {
            source_id,
            stable_key: key.to_string(),
            title: "Federal 9mm 124gr JHP".to_string(),
            brand: Some("Federal".to_string()),
            url: Some("https://shop.example.com/federal-9mm".to_string()),
            normalized_url: Some("shop.example.com/federal-9mm".to_string()),
            attributes: None,
            caliber: Some("9mm".to_string()),
            grain_weight: Some(124),
            round_count: Some(50),
            price_cents: Some(2499),
            identifiers: vec![(IdentifierKind::Upc, "012345678901".to_string())],
        }
    }

    #[test]
    fn test_source_product_upsert_is_stable() {
        let (store, _temp) = test_store();

        let first = store.upsert_source_product(&sample_row(1, "SKU-1")).unwrap();
        assert!(first.created);
        assert!(first.price_written);

        let second = store.upsert_source_product(&sample_row(1, "SKU-1")).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.created);

        let loaded = store.get_source_product(first.id).unwrap().unwrap();
        assert_eq!(loaded.stable_key, "SKU-1");
        assert_eq!(
            loaded.identifiers,
            vec![(IdentifierKind::Upc, "012345678901".to_string())]
        );
    }

    #[test]
    fn test_product_create_race_reads_winner() {
        let (store, _temp) = test_store();

        let fields = ProductFields {
            canonical_key: "UPC:012345678901".to_string(),
            name: "Federal 9mm 124gr JHP".to_string(),
            category: None,
            brand: Some("Federal".to_string()),
            brand_norm: Some("federal".to_string()),
            caliber: Some("9mm".to_string()),
            caliber_norm: Some("9mm".to_string()),
            grain_weight: Some(124),
            round_count: Some(50),
            upc_norm: Some("012345678901".to_string()),
        };

        let first = store.insert_product(&fields).unwrap();
        let second = store.insert_product(&fields).unwrap();

        match (first, second) {
            (ProductCreate::Created(a), ProductCreate::Raced(b)) => assert_eq!(a, b),
            other => panic!("unexpected create outcomes: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_request_recycling() {
        let (store, _temp) = test_store();
        let sp = store.upsert_source_product(&sample_row(2, "SKU-2")).unwrap();

        store.ensure_pending_request(sp.id).unwrap();
        let req = store.get_request(sp.id).unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Pending);

        // A second ensure while open must not reset anything.
        assert_eq!(store.claim_requests_processing(sp.id).unwrap(), 1);
        store.ensure_pending_request(sp.id).unwrap();
        let req = store.get_request(sp.id).unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Processing);

        assert_eq!(store.complete_requests(sp.id, Some(77)).unwrap(), 1);
        let req = store.get_request(sp.id).unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.result_product_id, Some(77));

        // Completed rows recycle back to PENDING.
        store.ensure_pending_request(sp.id).unwrap();
        let req = store.get_request(sp.id).unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.attempts, 0);
    }

    #[test]
    fn test_trust_config_version_bumps() {
        let (store, _temp) = test_store();

        let absent = store.get_trust_config(42).unwrap();
        assert!(!absent.upc_trusted);
        assert_eq!(absent.version, 0);

        let v1 = store.upsert_trust_config(42, true).unwrap();
        assert_eq!(v1, 1);
        let v2 = store.upsert_trust_config(42, false).unwrap();
        assert_eq!(v2, 2);

        let cfg = store.get_trust_config(42).unwrap();
        assert!(!cfg.upc_trusted);
        assert_eq!(cfg.version, 2);
    }

    #[test]
    fn test_seen_set_promotion_and_active_counts() {
        let (store, _temp) = test_store();
        let a = store.upsert_source_product(&sample_row(3, "A")).unwrap();
        let b = store.upsert_source_product(&sample_row(3, "B")).unwrap();

        let now = now_ts();

        store.record_seen("run-1", a.id).unwrap();
        store.record_seen("run-1", b.id).unwrap();
        assert_eq!(store.promote_seen_set("run-1", now).unwrap(), 2);
        assert_eq!(store.count_active_products(3, now - 60).unwrap(), 2);

        // Next run only sees A; B would be expired by promotion.
        store.record_seen("run-2", a.id).unwrap();
        assert_eq!(store.count_active_unseen(3, "run-2", now - 60).unwrap(), 1);
    }
}
