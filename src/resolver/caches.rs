//! In-memory caches for per-source trust config and global brand aliases.
//!
//! Trust entries live 60 seconds and the cache is capped at 100 sources with
//! LRU eviction. The brand-alias map is a full snapshot swapped atomically;
//! readers always see a consistent map. Alias hit counters are persisted
//! fire-and-forget and never affect resolution.

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::models::TrustConfig;
use crate::normalize::AliasLookup;
use crate::store::Store;

const TRUST_TTL: Duration = Duration::from_secs(60);
const TRUST_CAPACITY: usize = 100;

struct TrustEntry {
    config: TrustConfig,
    fetched_at: Instant,
    last_used: Instant,
}

/// TTL + LRU cache over `source_trust_config`.
pub struct TrustCache {
    store: Store,
    entries: Mutex<HashMap<i64, TrustEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl TrustCache {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: Mutex::new(HashMap::new()),
            ttl: TRUST_TTL,
            capacity: TRUST_CAPACITY,
        })
    }

    /// Fetch the trust config, via cache. Absent rows resolve to the
    /// untrusted default with version 0.
    pub fn get(&self, source_id: i64) -> Result<TrustConfig> {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&source_id) {
                if now.duration_since(entry.fetched_at) < self.ttl {
                    entry.last_used = now;
                    return Ok(entry.config);
                }
            }
        }

        let config = self.store.get_trust_config(source_id)?;

        let mut entries = self.entries.lock();
        entries.insert(
            source_id,
            TrustEntry {
                config,
                fetched_at: now,
                last_used: now,
            },
        );

        // Simple LRU on overflow.
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k);
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }

        Ok(config)
    }

    pub fn invalidate(&self, source_id: i64) {
        self.entries.lock().remove(&source_id);
    }

    /// Admin operation: drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[derive(Debug, Clone)]
struct AliasTarget {
    to_norm: String,
    alias_id: i64,
}

/// Snapshot cache of the full brand-alias map.
pub struct BrandAliasCache {
    store: Store,
    map: ArcSwap<HashMap<String, AliasTarget>>,
    hit_tx: mpsc::UnboundedSender<i64>,
}

impl BrandAliasCache {
    pub fn new(store: Store) -> Arc<Self> {
        let (hit_tx, hit_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            store: store.clone(),
            map: ArcSwap::from_pointee(HashMap::new()),
            hit_tx,
        });
        Self::spawn_hit_recorder(store, hit_rx);
        cache
    }

    fn spawn_hit_recorder(store: Store, mut hit_rx: mpsc::UnboundedReceiver<i64>) {
        tokio::spawn(async move {
            while let Some(alias_id) = hit_rx.recv().await {
                if let Err(e) = store.bump_brand_alias_hit(alias_id) {
                    // Hit accounting is best-effort.
                    debug!(alias_id, error = %e, "failed to record brand alias hit");
                }
            }
        });
    }

    /// Reload the alias map from the database.
    pub fn rebuild(&self) -> Result<usize> {
        let aliases = self.store.list_brand_aliases()?;
        let mut map = HashMap::with_capacity(aliases.len());
        for alias in aliases {
            map.insert(
                alias.from_norm,
                AliasTarget {
                    to_norm: alias.to_norm,
                    alias_id: alias.id,
                },
            );
        }
        let count = map.len();
        self.map.store(Arc::new(map));
        Ok(count)
    }

    /// Apply a brand alias if one exists. Alias application is flagged so
    /// evidence can record it; hits are counted out-of-band.
    pub fn lookup(&self, brand_norm: &str) -> AliasLookup {
        let map = self.map.load();
        match map.get(brand_norm) {
            Some(target) => {
                let _ = self.hit_tx.send(target.alias_id);
                AliasLookup {
                    resolved: target.to_norm.clone(),
                    alias_applied: true,
                    alias_id: Some(target.alias_id),
                }
            }
            None => AliasLookup {
                resolved: brand_norm.to_string(),
                alias_applied: false,
                alias_id: None,
            },
        }
    }

    /// Periodic rebuild plus rebuild-on-invalidation.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        refresh_interval: Duration,
        mut invalidate_rx: broadcast::Receiver<()>,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    recv = invalidate_rx.recv() => {
                        match recv {
                            Ok(()) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => {
                                // Sender gone; fall back to periodic refresh only.
                                ticker.tick().await;
                            }
                        }
                    }
                }
                if let Err(e) = cache.rebuild() {
                    warn!(error = %e, "brand alias cache rebuild failed");
                }
            }
        });
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

    #[tokio::test]
    async fn test_trust_cache_miss_default_and_invalidate() {
        let (store, _temp) = test_store();
        let cache = TrustCache::new(store.clone());

        let absent = cache.get(5).unwrap();
        assert!(!absent.upc_trusted);
        assert_eq!(absent.version, 0);

        store.upsert_trust_config(5, true).unwrap();
        // Still cached as untrusted until invalidated or expired.
        assert!(!cache.get(5).unwrap().upc_trusted);

        cache.invalidate(5);
        assert!(cache.get(5).unwrap().upc_trusted);
    }

    #[tokio::test]
    async fn test_trust_cache_lru_bound() {
        let (store, _temp) = test_store();
        let cache = TrustCache::new(store);

        for source_id in 0..(TRUST_CAPACITY as i64 + 20) {
            cache.get(source_id).unwrap();
        }
        assert!(cache.len() <= TRUST_CAPACITY);
    }

    #[tokio::test]
    async fn test_brand_alias_lookup() {
        let (store, _temp) = test_store();
        store.insert_brand_alias("fed", "federal").unwrap();

        let cache = BrandAliasCache::new(store);
        cache.rebuild().unwrap();

        let hit = cache.lookup("fed");
        assert_eq!(hit.resolved, "federal");
        assert!(hit.alias_applied);
        assert!(hit.alias_id.is_some());

        let miss = cache.lookup("federal");
        assert_eq!(miss.resolved, "federal");
        assert!(!miss.alias_applied);
        assert!(miss.alias_id.is_none());
    }
}
