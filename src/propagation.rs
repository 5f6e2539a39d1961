// 📡 Change Propagator - merge a writer's committed delta into the reader
//
// Propagation finishes before the save coordinator reports completion, so a
// caller told "import finished" can rely on the reader already reflecting it.
// Merging the same commit twice is a no-op.

use crate::entities::EntityKind;
use crate::error::SyncResult;
use crate::store::{ReaderContext, Session};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ============================================================================
// CHANGE DELTA
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDelta {
    pub inserted: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl KindDelta {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Identity keys touched by one committed unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDelta {
    /// Assigned at commit; 0 until then
    pub commit_id: u64,
    /// Name of the writer context that produced it
    pub source: String,
    pub kinds: BTreeMap<EntityKind, KindDelta>,
}

impl ChangeDelta {
    pub fn new(source: &str) -> Self {
        ChangeDelta {
            commit_id: 0,
            source: source.to_string(),
            kinds: BTreeMap::new(),
        }
    }

    pub fn record_insert(&mut self, kind: EntityKind, id: &str) {
        let entry = self.kinds.entry(kind).or_default();
        if entry.deleted.remove(id) {
            // Deleted then re-created in one unit: the identity survives with new values
            entry.updated.insert(id.to_string());
        } else {
            entry.inserted.insert(id.to_string());
        }
    }

    pub fn record_update(&mut self, kind: EntityKind, id: &str) {
        let entry = self.kinds.entry(kind).or_default();
        if !entry.inserted.contains(id) {
            entry.updated.insert(id.to_string());
        }
    }

    pub fn record_delete(&mut self, kind: EntityKind, id: &str) {
        let entry = self.kinds.entry(kind).or_default();
        if entry.inserted.remove(id) {
            // Never visible outside this unit
            return;
        }
        entry.updated.remove(id);
        entry.deleted.insert(id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.values().all(KindDelta::is_empty)
    }

    /// (inserted, updated, deleted) totals across kinds
    pub fn counts(&self) -> (usize, usize, usize) {
        self.kinds.values().fold((0, 0, 0), |(i, u, d), k| {
            (i + k.inserted.len(), u + k.updated.len(), d + k.deleted.len())
        })
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindDelta> {
        self.kinds.get(&kind)
    }
}

// ============================================================================
// MERGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge
    Empty,
    /// This commit was merged before
    AlreadyApplied,
    Applied { refreshed: usize, evicted: usize },
    /// The reader context is gone; nothing can be stale
    ReaderUnavailable,
}

/// Apply a delta to the reader's session: refresh cached records that changed,
/// evict deleted ones. Records the reader never materialized are left alone;
/// its next read goes to the store.
pub(crate) fn merge_into(session: &mut Session, delta: &ChangeDelta) -> MergeOutcome {
    if delta.is_empty() {
        return MergeOutcome::Empty;
    }
    if !session.mark_merged(delta.commit_id) {
        return MergeOutcome::AlreadyApplied;
    }

    let mut refreshed = 0;
    let mut evicted = 0;
    for (kind, changes) in &delta.kinds {
        for id in &changes.deleted {
            if session.evict(*kind, id) {
                evicted += 1;
            }
        }
        for id in changes.inserted.iter().chain(changes.updated.iter()) {
            if session.is_cached(*kind, id) {
                if session.refresh(*kind, id) {
                    refreshed += 1;
                } else {
                    evicted += 1;
                }
            }
        }
    }

    debug!(
        commit_id = delta.commit_id,
        source = %delta.source,
        refreshed,
        evicted,
        "delta merged into reader"
    );
    MergeOutcome::Applied { refreshed, evicted }
}

// ============================================================================
// PROPAGATOR
// ============================================================================

#[derive(Clone)]
pub struct ChangePropagator {
    reader: ReaderContext,
}

impl ChangePropagator {
    pub fn new(reader: ReaderContext) -> Self {
        ChangePropagator { reader }
    }

    pub fn reader(&self) -> &ReaderContext {
        &self.reader
    }

    /// Merge `delta` into the reader and wait for it to finish
    pub async fn propagate(&self, delta: &ChangeDelta) -> SyncResult<MergeOutcome> {
        if delta.is_empty() {
            return Ok(MergeOutcome::Empty);
        }
        self.reader.merge(delta.clone()).await
    }

    /// Blocking variant, called from a writer context's own queue after commit
    pub(crate) fn propagate_blocking(&self, delta: &ChangeDelta) -> MergeOutcome {
        if delta.is_empty() {
            return MergeOutcome::Empty;
        }
        match self.reader.merge_blocking(delta.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(commit_id = delta.commit_id, error = %e, "reader unavailable for propagation");
                MergeOutcome::ReaderUnavailable
            }
        }
    }
}
