// ⚖️ Reconciliation Engine - diff a target entity set against the store
//
// reconcile(target, scope) → ChangeSet{create, update, delete}; apply(ChangeSet).
//
// Keys present in the store (within scope) but absent from the target are
// deleted, so an empty target under Scope::Full empties the kind. Narrow paths
// (upsert, patch) never diff and refuse empty input instead.
//
// Identity collisions (two rows sharing one key) are repaired before the diff:
// the lowest row is kept, the rest are deleted and their incoming links moved.

use crate::config::StoreConfig;
use crate::entities::{DomainEntity, EntityKind, Reference};
use crate::error::{SyncError, SyncResult};
use crate::resolver::{ReferenceResolver, WireStats};
use crate::store::{changed_fields, encode_fields, FieldMap, PersistedRecord, Session};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

// ============================================================================
// SCOPE
// ============================================================================

/// Which persisted records a reconciliation pass may touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Every persisted record of the kind
    Full,
    /// Only these identity keys (e.g. one series' occurrences, one month of aggregates)
    Keys(BTreeSet<String>),
}

impl Scope {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            Scope::Full => true,
            Scope::Keys(keys) => keys.contains(key),
        }
    }
}

// ============================================================================
// CHANGE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct EntityUpdate<T> {
    pub row_id: i64,
    pub old: T,
    pub new: T,
    /// Top-level payload fields that differ
    pub changed: Vec<String>,
}

/// Disjoint create/update/delete sets over identity keys.
///
/// Target entities identical to their persisted record are counted in
/// `unchanged` rather than listed in `to_update`, so reconciling the same
/// target twice yields an empty change set.
#[derive(Debug, Clone)]
pub struct ChangeSet<T> {
    pub kind: EntityKind,
    pub to_create: Vec<T>,
    pub to_update: Vec<EntityUpdate<T>>,
    pub to_delete: BTreeSet<String>,
    pub unchanged: usize,
    /// Duplicate rows removed while building this set
    pub collisions_repaired: usize,
}

impl<T: DomainEntity> ChangeSet<T> {
    fn new() -> Self {
        ChangeSet {
            kind: T::KIND,
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: BTreeSet::new(),
            unchanged: 0,
            collisions_repaired: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn created_keys(&self) -> Vec<&str> {
        self.to_create.iter().map(|e| e.id()).collect()
    }

    pub fn updated_keys(&self) -> Vec<&str> {
        self.to_update.iter().map(|u| u.new.id()).collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} create, {} update, {} delete, {} unchanged, {} collisions repaired",
            self.kind,
            self.to_create.len(),
            self.to_update.len(),
            self.to_delete.len(),
            self.unchanged,
            self.collisions_repaired
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    #[serde(skip)]
    pub links: WireStats,
}

/// reconcile + apply in one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub applied: ApplyReport,
    pub unchanged: usize,
    pub collisions_repaired: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    resolver: ReferenceResolver,
}

impl ReconciliationEngine {
    pub fn new(resolver: ReferenceResolver) -> Self {
        ReconciliationEngine { resolver }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(ReferenceResolver::from_config(config))
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Diff `target` against persisted records of `T::KIND` within `scope`.
    ///
    /// Runs inside a unit of work: colliding rows are deleted here, before
    /// the diff. A QueryFailure is returned as-is so the caller can tell
    /// "store unreadable" apart from "nothing to do".
    pub fn reconcile<T: DomainEntity>(
        &self,
        target: &[T],
        scope: &Scope,
        session: &mut Session,
    ) -> SyncResult<ChangeSet<T>> {
        session.ensure_unit()?;
        let kind = T::KIND;
        let mut changes = ChangeSet::<T>::new();

        // A later entry for the same key replaces an earlier one
        let mut order: Vec<&T> = Vec::with_capacity(target.len());
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(target.len());
        for entity in target {
            match position.get(entity.id()) {
                Some(&at) => order[at] = entity,
                None => {
                    position.insert(entity.id(), order.len());
                    order.push(entity);
                }
            }
        }

        let records = match scope {
            Scope::Full => session.fetch_records(kind, None)?,
            Scope::Keys(keys) => {
                let mut lookup = keys.clone();
                lookup.extend(position.keys().map(|k| k.to_string()));
                session.fetch_records(kind, Some(&lookup))?
            }
        };

        // ====================================================================
        // Self-heal identity collisions (records arrive in row order)
        // ====================================================================
        let mut existing: HashMap<String, PersistedRecord> = HashMap::with_capacity(records.len());
        let mut duplicates: Vec<(String, i64, i64)> = Vec::new();
        for record in records {
            match existing.get(&record.id) {
                Some(kept) => duplicates.push((record.id.clone(), record.row_id, kept.row_id)),
                None => {
                    existing.insert(record.id.clone(), record);
                }
            }
        }
        for (id, duplicate_row, kept_row) in duplicates {
            warn!(%kind, id = %id, duplicate_row, kept_row, "identity collision repaired");
            session.remove_duplicate_row(kind, &id, duplicate_row, kept_row)?;
            changes.collisions_repaired += 1;
        }

        // ====================================================================
        // Diff
        // ====================================================================
        for entity in order {
            match existing.get(entity.id()) {
                Some(record) => {
                    let new_fields = encode_fields(entity)?;
                    let changed = changed_fields(&record.fields, &new_fields);
                    if changed.is_empty() {
                        changes.unchanged += 1;
                    } else {
                        changes.to_update.push(EntityUpdate {
                            row_id: record.row_id,
                            old: record.decode::<T>()?,
                            new: entity.clone(),
                            changed,
                        });
                    }
                }
                None => changes.to_create.push(entity.clone()),
            }
        }

        for key in existing.keys() {
            if scope.contains(key) && !position.contains_key(key.as_str()) {
                changes.to_delete.insert(key.clone());
            }
        }

        if target.is_empty() && !changes.to_delete.is_empty() {
            warn!(%kind, deletes = changes.to_delete.len(), "empty target deletes every record in scope");
        }
        debug!("{}", changes.summary());
        Ok(changes)
    }

    /// Apply a change set: deletes, then creates, then updates. References of
    /// created and re-pointed entities are resolved in one prefetch pass.
    pub fn apply<T: DomainEntity>(&self, changes: ChangeSet<T>, session: &mut Session) -> SyncResult<ApplyReport> {
        session.ensure_unit()?;
        let kind = T::KIND;
        let mut report = ApplyReport::default();

        for key in &changes.to_delete {
            if session.delete_identity(kind, key)? > 0 {
                report.deleted += 1;
            }
        }

        let mut to_wire: Vec<(i64, Vec<Reference>)> = Vec::new();
        for entity in &changes.to_create {
            let row_id = session.insert_entity(entity)?;
            report.created += 1;
            to_wire.push((row_id, entity.references()));
        }

        for update in &changes.to_update {
            let new_fields = encode_fields(&update.new)?;
            // Only fields this diff found changed; others keep their persisted value
            let partial: FieldMap = update
                .changed
                .iter()
                .filter_map(|key| new_fields.get(key).map(|value| (key.clone(), value.clone())))
                .collect();
            let merged: T = session.update_fields(update.row_id, &partial)?;
            report.updated += 1;

            let refs = merged.references();
            if refs != update.old.references() {
                to_wire.push((update.row_id, refs));
            }
        }

        report.links = self.wire_all(session, kind, &to_wire)?;
        Ok(report)
    }

    /// reconcile then apply
    pub fn sync<T: DomainEntity>(&self, target: &[T], scope: &Scope, session: &mut Session) -> SyncResult<SyncReport> {
        let changes = self.reconcile(target, scope, session)?;
        let unchanged = changes.unchanged;
        let collisions_repaired = changes.collisions_repaired;
        let applied = self.apply(changes, session)?;

        info!(
            kind = %T::KIND,
            created = applied.created,
            updated = applied.updated,
            deleted = applied.deleted,
            unchanged,
            collisions_repaired,
            "reconciled"
        );
        Ok(SyncReport {
            kind: T::KIND,
            applied,
            unchanged,
            collisions_repaired,
        })
    }

    // ========================================================================
    // NARROW PATHS (UI edits, producers) - no diff
    // ========================================================================

    /// Create or overwrite one entity. Always writes and rewires.
    pub fn upsert<T: DomainEntity>(&self, entity: &T, session: &mut Session) -> SyncResult<i64> {
        session.ensure_unit()?;
        let row_id = match session.fetch_record(T::KIND, entity.id())? {
            Some(record) => {
                session.update_fields::<T>(record.row_id, &encode_fields(entity)?)?;
                record.row_id
            }
            None => session.insert_entity(entity)?,
        };

        let refs = entity.references();
        let index = self.resolver.resolve_each(session, &refs)?;
        self.resolver.wire(session, T::KIND, row_id, &refs, &index)?;
        Ok(row_id)
    }

    /// Batched `upsert`. An empty batch is rejected: it never means "no change".
    pub fn upsert_many<T: DomainEntity>(&self, entities: &[T], session: &mut Session) -> SyncResult<ApplyReport> {
        if entities.is_empty() {
            return Err(SyncError::aborted(format!("empty upsert of {}", T::KIND)));
        }
        session.ensure_unit()?;

        let keys: BTreeSet<String> = entities.iter().map(|e| e.id().to_string()).collect();
        let existing: HashMap<String, i64> = first_rows(session.fetch_records(T::KIND, Some(&keys))?);

        let mut report = ApplyReport::default();
        let mut to_wire = Vec::with_capacity(entities.len());
        for entity in entities {
            let row_id = match existing.get(entity.id()) {
                Some(&row_id) => {
                    session.update_fields::<T>(row_id, &encode_fields(entity)?)?;
                    report.updated += 1;
                    row_id
                }
                None => {
                    report.created += 1;
                    session.insert_entity(entity)?
                }
            };
            to_wire.push((row_id, entity.references()));
        }

        report.links = self.wire_all(session, T::KIND, &to_wire)?;
        Ok(report)
    }

    /// Create the entities whose keys are not persisted yet; leave the rest alone
    pub fn insert_missing<T: DomainEntity>(&self, entities: &[T], session: &mut Session) -> SyncResult<usize> {
        session.ensure_unit()?;
        if entities.is_empty() {
            return Ok(0);
        }
        let keys: BTreeSet<String> = entities.iter().map(|e| e.id().to_string()).collect();
        let mut known: BTreeSet<String> = session
            .fetch_records(T::KIND, Some(&keys))?
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut to_wire = Vec::new();
        for entity in entities {
            if known.insert(entity.id().to_string()) {
                let row_id = session.insert_entity(entity)?;
                to_wire.push((row_id, entity.references()));
            }
        }

        self.wire_all(session, T::KIND, &to_wire)?;
        debug!(kind = %T::KIND, inserted = to_wire.len(), "inserted missing entities");
        Ok(to_wire.len())
    }

    /// Write only the named fields of one entity (per-field last-writer-wins).
    pub fn patch<T: DomainEntity>(&self, id: &str, fields: FieldMap, session: &mut Session) -> SyncResult<T> {
        if fields.is_empty() {
            return Err(SyncError::aborted(format!("empty patch of {} {}", T::KIND, id)));
        }
        if fields.get("id").is_some_and(|value| value.as_str() != Some(id)) {
            return Err(SyncError::aborted(format!("identity key of {} {} is immutable", T::KIND, id)));
        }
        session.ensure_unit()?;

        let Some(record) = session.fetch_record(T::KIND, id)? else {
            return Err(SyncError::aborted(format!("no {} with id {}", T::KIND, id)));
        };
        let old_refs = record.decode::<T>()?.references();
        let merged: T = session.update_fields(record.row_id, &fields)?;

        let refs = merged.references();
        if refs != old_refs {
            let index = self.resolver.resolve_each(session, &refs)?;
            self.resolver.wire(session, T::KIND, record.row_id, &refs, &index)?;
        }
        Ok(merged)
    }

    /// Explicit delete. Referrers keep their soft keys; their live links go dangling.
    pub fn delete(&self, kind: EntityKind, id: &str, session: &mut Session) -> SyncResult<bool> {
        Ok(session.delete_identity(kind, id)? > 0)
    }

    fn wire_all(&self, session: &mut Session, kind: EntityKind, owners: &[(i64, Vec<Reference>)]) -> SyncResult<WireStats> {
        let mut stats = WireStats::default();
        if owners.is_empty() {
            return Ok(stats);
        }
        let index = self.resolver.prefetch(session, owners.iter().flat_map(|(_, refs)| refs.iter()))?;
        for (row_id, refs) in owners {
            stats += self.resolver.wire(session, kind, *row_id, refs, &index)?;
        }
        Ok(stats)
    }
}

/// Identity key → lowest row id
fn first_rows(records: Vec<PersistedRecord>) -> HashMap<String, i64> {
    let mut rows = HashMap::with_capacity(records.len());
    for record in records {
        rows.entry(record.id).or_insert(record.row_id);
    }
    rows
}

// ============================================================================
// TESTS
// ============================================================================
