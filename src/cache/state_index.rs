// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::types::LockStatus;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Last-known state of one namespace. Advisory only.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactRecord {
    pub name: Arc<str>,
    pub status: u8,
    pub last_seen: i64,
    pub hash: u32,
}

impl CompactRecord {
    pub fn lock_status(&self) -> LockStatus {
        LockStatus::from_code(self.status)
    }
}

pub fn name_hash(name: &str) -> u32 {
    xxh3_64(name.as_bytes()) as u32
}

#[derive(Default)]
struct Slab {
    records: Vec<CompactRecord>,
    slots: HashMap<Arc<str>, usize>,
    dropped: u64,
}

/// Bounded cache of the last status the reconciler saw per namespace.
///
/// Records live densely in a slab; a side map resolves names to slots.
/// Removal moves the last record into the hole. Once `capacity` records are
/// held, updates for unknown names are dropped. Nothing here is consulted
/// to decide what a namespace should look like.
pub struct CompactStateIndex {
    inner: RwLock<Slab>,
    capacity: usize,
}

impl CompactStateIndex {
    pub fn new(capacity: usize) -> CompactStateIndex {
        CompactStateIndex {
            inner: RwLock::new(Slab::default()),
            capacity,
        }
    }

    /// Records `status` for `name`. Returns false when the index is full and
    /// the name was not already present.
    pub fn update(&self, name: Arc<str>, status: LockStatus) -> bool {
        let now = Utc::now().timestamp();
        let mut slab = self.inner.write();
        if let Some(&slot) = slab.slots.get(&name) {
            let record = &mut slab.records[slot];
            record.status = status.code();
            record.last_seen = now;
            return true;
        }
        if slab.records.len() >= self.capacity {
            slab.dropped += 1;
            return false;
        }
        let slot = slab.records.len();
        let hash = name_hash(&name);
        slab.records.push(CompactRecord {
            name: name.clone(),
            status: status.code(),
            last_seen: now,
            hash,
        });
        slab.slots.insert(name, slot);
        true
    }

    pub fn get(&self, name: &str) -> Option<CompactRecord> {
        let slab = self.inner.read();
        let slot = *slab.slots.get(name)?;
        slab.records.get(slot).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut slab = self.inner.write();
        let slot = match slab.slots.remove(name) {
            Some(slot) => slot,
            None => return false,
        };
        slab.records.swap_remove(slot);
        if slot < slab.records.len() {
            let moved = slab.records[slot].name.clone();
            slab.slots.insert(moved, slot);
        }
        true
    }

    /// Releases memory when fewer than half of the allocated slots are live.
    pub fn compact(&self) -> bool {
        let mut slab = self.inner.write();
        let live = slab.records.len();
        let allocated = slab.records.capacity();
        if allocated == 0 || live * 2 >= allocated {
            return false;
        }
        let target = std::cmp::max(live, allocated / 2);
        slab.records.shrink_to(target);
        slab.slots.shrink_to(target);
        true
    }

    pub fn reset(&self) {
        let mut slab = self.inner.write();
        slab.records = Vec::new();
        slab.slots = HashMap::new();
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        self.inner.read().records.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.read().dropped
    }

    /// Number of records per status, for diagnostics.
    pub fn status_counts(&self) -> HashMap<LockStatus, usize> {
        let slab = self.inner.read();
        let mut counts = HashMap::new();
        for record in slab.records.iter() {
            *counts.entry(record.lock_status()).or_insert(0) += 1;
        }
        counts
    }
}
