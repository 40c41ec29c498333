// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Bounded string deduplication for namespace names.
///
/// Returns a shared `Arc<str>` for names already pooled. Once the pool is full
/// new names are handed back as fresh allocations without being pooled.
pub struct InternPool {
    pool: RwLock<HashSet<Arc<str>>>,
    max_entries: usize,
}

impl InternPool {
    pub fn new(max_entries: usize) -> InternPool {
        InternPool {
            pool: RwLock::new(HashSet::new()),
            max_entries,
        }
    }

    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(shared) = self.pool.read().get(s) {
            return shared.clone();
        }
        let mut pool = self.pool.write();
        // Another writer may have pooled it between the two locks.
        if let Some(shared) = pool.get(s) {
            return shared.clone();
        }
        let fresh: Arc<str> = Arc::from(s);
        if pool.len() < self.max_entries {
            pool.insert(fresh.clone());
        }
        fresh
    }

    /// Clears the pool when it is more than half full.
    pub fn cleanup_old_entries(&self) -> bool {
        let mut pool = self.pool.write();
        if pool.len() * 2 <= self.max_entries {
            return false;
        }
        pool.clear();
        true
    }

    pub fn reset(&self) {
        let mut pool = self.pool.write();
        pool.clear();
        pool.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.pool.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
