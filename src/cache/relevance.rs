// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Fast reject test in front of the reconciler.
///
/// Holds the names referenced by outstanding LockRequests or carrying lock
/// markers at the last refresh, plus names inserted by the event source since.
/// Entries are never removed one by one; the whole set is rebuilt by
/// [`RelevanceFilter::refresh`] and may be stale in between. Rejecting a name
/// only skips work, the periodic scans still converge it.
pub struct RelevanceFilter {
    inner: RwLock<FilterState>,
    max_entries: usize,
}

struct FilterState {
    names: HashSet<Arc<str>>,
    refreshed_at: Option<Instant>,
    generation: u64,
}

impl RelevanceFilter {
    pub fn new(max_entries: usize) -> RelevanceFilter {
        RelevanceFilter {
            inner: RwLock::new(FilterState {
                names: HashSet::new(),
                refreshed_at: None,
                generation: 0,
            }),
            max_entries,
        }
    }

    pub fn should_process(&self, name: &str) -> bool {
        self.inner.read().names.contains(name)
    }

    /// Replaces the whole set with an authoritative list of names.
    pub fn refresh<I>(&self, names: I)
    where
        I: IntoIterator<Item = Arc<str>>,
    {
        let names: HashSet<Arc<str>> = names.into_iter().collect();
        let mut state = self.inner.write();
        state.names = names;
        state.refreshed_at = Some(Instant::now());
        state.generation += 1;
        info!(
            entries = state.names.len(),
            generation = state.generation,
            "Relevance filter refreshed"
        );
        drop(state);
        self.cleanup_expired_entries();
    }

    /// Seeds a single name, e.g. a namespace just observed carrying lock markers.
    pub fn insert(&self, name: Arc<str>) {
        let grew_past_bound = {
            let mut state = self.inner.write();
            state.names.insert(name);
            state.names.len() > self.max_entries
        };
        if grew_past_bound {
            self.cleanup_expired_entries();
        }
    }

    /// Drops the entire set once it has grown past its bound.
    /// Names lost this way are rejected until the next refresh.
    pub fn cleanup_expired_entries(&self) -> bool {
        let mut state = self.inner.write();
        if state.names.len() <= self.max_entries {
            return false;
        }
        warn!(
            entries = state.names.len(),
            max_entries = self.max_entries,
            "Relevance filter grew past its bound, dropping it until the next refresh"
        );
        state.names = HashSet::new();
        true
    }

    pub fn reset(&self) {
        let mut state = self.inner.write();
        state.names = HashSet::new();
        state.refreshed_at = None;
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.inner.read().refreshed_at
    }
}
