#![forbid(unsafe_code)]
//! Append-only change journal for a SnapFS mount.
//!
//! Two entry shapes matter to the checkout engine: *hash updates* (the mount
//! moved from one commit root to another) and *unclean paths* (a hash update
//! plus the set of working-copy paths that differed along the way).
//! Subscribers are poked after every append and can be cancelled in bulk
//! during shutdown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_types::{RepoPath, RootId};
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// ── Entries ─────────────────────────────────────────────────────────────────

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalDelta {
    /// The mount's parent commit changed. `from` is `None` for the initial
    /// record written when the mount is first initialized.
    HashUpdate {
        from: Option<RootId>,
        to: RootId,
    },
    /// A parent change together with the paths whose working-copy content
    /// differed from the committed content.
    UncleanPaths {
        from: RootId,
        to: RootId,
        paths: BTreeSet<RepoPath>,
    },
}

/// A delta with its position in the journal. Sequence numbers start at 1
/// and never repeat within a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub delta: JournalDelta,
}

/// Aggregate counters, in the spirit of the usual stats structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalStats {
    pub entry_count: u64,
    pub hash_updates: u64,
    pub unclean_entries: u64,
    pub unclean_path_count: u64,
}

// ── Subscribers ─────────────────────────────────────────────────────────────

/// Identifier returned by [`Journal::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type SubscriberCallback = Arc<dyn Fn(&JournalEntry) + Send + Sync>;

#[derive(Default)]
struct SubscriberState {
    next_id: u64,
    active: HashMap<u64, SubscriberCallback>,
}

// ── Journal ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct JournalState {
    entries: Vec<JournalEntry>,
    next_seq: u64,
}

/// In-memory append-only journal.
#[derive(Default)]
pub struct Journal {
    state: Mutex<JournalState>,
    subscribers: Mutex<SubscriberState>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the parent commit moved from `from` to `to`.
    pub fn record_hash_update(&self, from: Option<RootId>, to: RootId) {
        debug!(?from, %to, "journal hash update");
        self.append(JournalDelta::HashUpdate { from, to });
    }

    /// Record a parent change plus the unclean paths observed by the diff.
    ///
    /// An empty path set degrades to a plain hash update, so one checkout
    /// appends exactly one entry either way.
    pub fn record_unclean_paths(
        &self,
        from: RootId,
        to: RootId,
        paths: BTreeSet<RepoPath>,
    ) {
        if paths.is_empty() {
            self.record_hash_update(Some(from), to);
            return;
        }
        debug!(%from, %to, count = paths.len(), "journal unclean paths");
        self.append(JournalDelta::UncleanPaths { from, to, paths });
    }

    fn append(&self, delta: JournalDelta) {
        let entry = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let entry = JournalEntry {
                seq: state.next_seq,
                delta,
            };
            state.entries.push(entry.clone());
            entry
        };
        let callbacks: Vec<SubscriberCallback> = {
            let subscribers = self.subscribers.lock();
            subscribers.active.values().cloned().collect()
        };
        for callback in callbacks {
            callback(&entry);
        }
    }

    /// The most recent entry, if any.
    #[must_use]
    pub fn latest(&self) -> Option<JournalEntry> {
        self.state.lock().entries.last().cloned()
    }

    /// Snapshot of all entries in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.state.lock().entries.clone()
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.state.lock().next_seq
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let state = self.state.lock();
        let mut stats = JournalStats::default();
        for entry in &state.entries {
            stats.entry_count += 1;
            match &entry.delta {
                JournalDelta::HashUpdate { .. } => stats.hash_updates += 1,
                JournalDelta::UncleanPaths { paths, .. } => {
                    stats.unclean_entries += 1;
                    stats.unclean_path_count += paths.len() as u64;
                }
            }
        }
        stats
    }

    /// Register a callback invoked after every append.
    pub fn subscribe(
        &self,
        callback: impl Fn(&JournalEntry) + Send + Sync + 'static,
    ) -> SubscriberId {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.active.insert(id, Arc::new(callback));
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().active.remove(&id.0);
    }

    /// Drop every subscriber. Called during mount shutdown.
    pub fn cancel_all_subscribers(&self) {
        let mut subscribers = self.subscribers.lock();
        let dropped = subscribers.active.len();
        subscribers.active.clear();
        debug!(dropped, "journal subscribers cancelled");
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().active.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
