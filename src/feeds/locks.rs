//! Process-wide advisory locks keyed by a stable 64-bit id.
//!
//! The lock table serializes per-feed operations: one ingest run per feed,
//! and expiry approval excludes concurrent promotion. Guards release on drop.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
pub struct AdvisoryLocks {
    held: Mutex<HashSet<i64>>,
}

impl AdvisoryLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire. Returns None when the key is already held.
    pub fn try_lock(self: &Arc<Self>, key: i64) -> Option<AdvisoryLockGuard> {
        let mut held = self.held.lock();
        if !held.insert(key) {
            return None;
        }
        Some(AdvisoryLockGuard {
            locks: self.clone(),
            key,
        })
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.held.lock().contains(&key)
    }
}

pub struct AdvisoryLockGuard {
    locks: Arc<AdvisoryLocks>,
    key: i64,
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_and_releases() {
        let locks = AdvisoryLocks::new();

        let guard = locks.try_lock(42).unwrap();
        assert!(locks.is_held(42));
        assert!(locks.try_lock(42).is_none());

        // Other keys are independent.
        assert!(locks.try_lock(43).is_some());

        drop(guard);
        assert!(!locks.is_held(42));
        assert!(locks.try_lock(42).is_some());
    }
}
