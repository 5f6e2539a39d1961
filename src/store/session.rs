// 🧵 Session - the state an execution context owns on its own queue
//
// One connection, one record cache, one open unit of work at a time. A Session
// is created on the context's worker thread and never leaves it (it is !Send).
// Outside code only ever sees `&Session` (read paths) or, through the save
// coordinator, `&mut Session` inside a unit of work.

use super::record::{encode_fields, FieldMap, PersistedRecord};
use super::ContextRole;
use crate::config::StoreConfig;
use crate::deduplication::Fingerprint;
use crate::entities::{DerivedColumns, DomainEntity, EntityKind};
use crate::error::{SyncError, SyncResult};
use crate::propagation::ChangeDelta;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Merged commit ids kept above a gap before the floor moves past it
const MERGE_WINDOW: usize = 256;

pub struct Session {
    name: Arc<str>,
    role: ContextRole,
    conn: Connection,
    config: StoreConfig,
    commit_seq: Arc<AtomicU64>,

    /// Records this context has materialized, as of its last refresh/merge
    cache: HashMap<(EntityKind, String), PersistedRecord>,

    /// Name of the open unit of work, if any
    unit: Option<String>,

    /// Changes made by the open unit of work
    delta: ChangeDelta,

    /// Last successful full read per kind (reader fallback source)
    snapshots: HashMap<EntityKind, Vec<FieldMap>>,

    /// Every commit id at or below this counts as merged
    merged_floor: u64,

    /// Merged commit ids above `merged_floor`
    merged_recent: BTreeSet<u64>,

    _queue_bound: PhantomData<*const ()>,
}

impl Session {
    pub(crate) fn new(
        name: Arc<str>,
        role: ContextRole,
        conn: Connection,
        config: StoreConfig,
        commit_seq: Arc<AtomicU64>,
        merged_floor: u64,
    ) -> Self {
        let delta = ChangeDelta::new(&name);
        Session {
            name,
            role,
            conn,
            config,
            commit_seq,
            cache: HashMap::new(),
            unit: None,
            delta,
            snapshots: HashMap::new(),
            merged_floor,
            merged_recent: BTreeSet::new(),
            _queue_bound: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Map a store error raised while writing into a commit failure of the open unit
    pub(crate) fn write_err(&self) -> impl Fn(rusqlite::Error) -> SyncError + '_ {
        move |source| SyncError::CommitFailure {
            operation: self.unit.clone().unwrap_or_else(|| self.name.to_string()),
            source,
        }
    }

    fn ensure_writable(&self) -> SyncResult<()> {
        debug_assert_eq!(self.role, ContextRole::Writer, "reader context used for a write");
        if self.unit.is_none() {
            return Err(SyncError::aborted("write outside a save operation"));
        }
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// All records of a kind, or only those whose key is in `keys`, in row order
    pub fn fetch_records(
        &self,
        kind: EntityKind,
        keys: Option<&BTreeSet<String>>,
    ) -> SyncResult<Vec<PersistedRecord>> {
        let table = kind.table();
        let on_err = SyncError::query(kind);

        let Some(keys) = keys else {
            let mut stmt = self
                .conn
                .prepare_cached(&format!(
                    "SELECT {} FROM {} ORDER BY row_id",
                    PersistedRecord::COLUMNS,
                    table
                ))
                .map_err(on_err)?;
            let records = stmt
                .query_map([], |row| PersistedRecord::from_row(kind, row))
                .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                .map_err(SyncError::query(kind))?;
            return Ok(records);
        };

        let keys: Vec<&String> = keys.iter().collect();
        let mut records = Vec::new();
        for chunk in keys.chunks(self.config.lookup_chunk_size) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT {} FROM {} WHERE id IN ({}) ORDER BY row_id",
                    PersistedRecord::COLUMNS,
                    table,
                    placeholders
                ))
                .map_err(SyncError::query(kind))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| PersistedRecord::from_row(kind, row))
                .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                .map_err(SyncError::query(kind))?;
            records.extend(rows);
        }
        // Chunks are each ordered; restore global row order
        records.sort_by_key(|r| r.row_id);
        Ok(records)
    }

    /// First record carrying `id` (by primary key order), limited to one result
    pub fn fetch_record(&self, kind: EntityKind, id: &str) -> SyncResult<Option<PersistedRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM {} WHERE id = ?1 ORDER BY row_id LIMIT 1",
                PersistedRecord::COLUMNS,
                kind.table()
            ))
            .map_err(SyncError::query(kind))?;
        stmt.query_row([id], |row| PersistedRecord::from_row(kind, row))
            .optional()
            .map_err(SyncError::query(kind))
    }

    /// Read a record through this context's cache
    pub(crate) fn materialize(&mut self, kind: EntityKind, id: &str) -> SyncResult<Option<&PersistedRecord>> {
        let key = (kind, id.to_string());
        if !self.cache.contains_key(&key) {
            match self.fetch_record(kind, id)? {
                Some(record) => {
                    self.cache.insert(key.clone(), record);
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get(&key))
    }

    pub fn count(&self, kind: EntityKind) -> SyncResult<i64> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| row.get(0))
            .map_err(SyncError::query(kind))
    }

    /// Distinct identity keys of a kind
    pub fn identity_keys(&self, kind: EntityKind) -> SyncResult<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT DISTINCT id FROM {}", kind.table()))
            .map_err(SyncError::query(kind))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<BTreeSet<_>, _>>())
            .map_err(SyncError::query(kind))?;
        Ok(keys)
    }

    /// Fingerprints of every persisted transaction
    pub fn fingerprints(&self) -> SyncResult<HashSet<Fingerprint>> {
        let kind = EntityKind::Transaction;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT fingerprint FROM transactions WHERE fingerprint IS NOT NULL")
            .map_err(SyncError::query(kind))?;
        let fingerprints = stmt
            .query_map([], |row| row.get::<_, String>(0).map(Fingerprint::from_stored))
            .and_then(|rows| rows.collect::<Result<HashSet<_>, _>>())
            .map_err(SyncError::query(kind))?;
        Ok(fingerprints)
    }

    // ========================================================================
    // WRITES (only inside a unit of work)
    // ========================================================================

    /// Insert through the normal lifecycle: derived columns computed here
    pub fn insert_entity<T: DomainEntity>(&mut self, entity: &T) -> SyncResult<i64> {
        self.ensure_writable()?;
        let fields = encode_fields(entity)?;
        let derived = entity.derived();
        let row_id = self.insert_row(T::KIND, entity.id(), &fields, &derived)?;

        self.delta.record_insert(T::KIND, entity.id());
        self.cache.remove(&(T::KIND, entity.id().to_string()));
        Ok(row_id)
    }

    fn insert_row(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &FieldMap,
        derived: &DerivedColumns,
    ) -> SyncResult<i64> {
        let payload = serde_json::to_string(fields)?;
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO {} (id, payload, sort_key, fingerprint, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                kind.table()
            ))
            .and_then(|mut stmt| {
                stmt.execute(params![
                    id,
                    payload,
                    derived.sort_key,
                    derived.fingerprint,
                    Utc::now().to_rfc3339()
                ])
            })
            .map_err(self.write_err())?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write only the given fields onto the current persisted payload.
    ///
    /// The payload is re-read inside the unit, so fields this write does not
    /// name keep whatever another context last committed (per-field LWW).
    /// Returns the merged entity.
    pub fn update_fields<T: DomainEntity>(&mut self, row_id: i64, fields: &FieldMap) -> SyncResult<T> {
        self.ensure_writable()?;
        let kind = T::KIND;
        let current: Option<(String, String)> = self
            .conn
            .query_row(
                &format!("SELECT id, payload FROM {} WHERE row_id = ?1", kind.table()),
                [row_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(SyncError::query(kind))?;
        let Some((id, payload)) = current else {
            return Err(SyncError::aborted(format!("{} row {} vanished during update", kind, row_id)));
        };

        let mut merged = match serde_json::from_str::<Value>(&payload)? {
            Value::Object(map) => map,
            _ => FieldMap::new(),
        };
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }

        let entity: T = serde_json::from_value(Value::Object(merged))?;
        // Stored payload is always the canonical encoding: legacy keys the
        // type no longer knows are dropped, unknown keys in `fields` refused
        let canonical = encode_fields(&entity)?;
        if let Some(unknown) = fields.keys().find(|key| !canonical.contains_key(*key)) {
            return Err(SyncError::aborted(format!("{} has no field '{}'", kind, unknown)));
        }
        let derived = entity.derived();
        let payload = serde_json::to_string(&canonical)?;

        self.conn
            .prepare_cached(&format!(
                "UPDATE {} SET payload = ?1, sort_key = ?2, fingerprint = ?3, updated_at = ?4 WHERE row_id = ?5",
                kind.table()
            ))
            .and_then(|mut stmt| {
                stmt.execute(params![
                    payload,
                    derived.sort_key,
                    derived.fingerprint,
                    Utc::now().to_rfc3339(),
                    row_id
                ])
            })
            .map_err(self.write_err())?;

        self.delta.record_update(kind, &id);
        self.cache.remove(&(kind, id));
        Ok(entity)
    }

    /// Delete every record carrying `id`. Incoming live links are nullified;
    /// the referrers' soft keys are untouched. Returns rows removed.
    pub fn delete_identity(&mut self, kind: EntityKind, id: &str) -> SyncResult<usize> {
        self.ensure_writable()?;
        let table = kind.table();
        let rows: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare_cached(&format!("SELECT row_id FROM {} WHERE id = ?1", table))
                .map_err(SyncError::query(kind))?;
            let rows = stmt
                .query_map([id], |row| row.get(0))
                .and_then(|rows| rows.collect::<Result<Vec<i64>, _>>())
                .map_err(SyncError::query(kind))?;
            rows
        };

        for row_id in &rows {
            self.detach_row(kind, *row_id, None)?;
        }
        self.conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])
            .map_err(self.write_err())?;

        if !rows.is_empty() {
            self.delta.record_delete(kind, id);
        }
        self.cache.remove(&(kind, id.to_string()));
        Ok(rows.len())
    }

    /// Remove one row of a colliding identity, moving incoming links to the kept row
    pub(crate) fn remove_duplicate_row(
        &mut self,
        kind: EntityKind,
        id: &str,
        duplicate_row: i64,
        kept_row: i64,
    ) -> SyncResult<()> {
        self.ensure_writable()?;
        self.detach_row(kind, duplicate_row, Some(kept_row))?;
        self.conn
            .execute(&format!("DELETE FROM {} WHERE row_id = ?1", kind.table()), [duplicate_row])
            .map_err(self.write_err())?;

        self.delta.record_update(kind, id);
        self.cache.remove(&(kind, id.to_string()));
        Ok(())
    }

    /// Drop a row's outgoing links and point incoming ones at `replacement` (or NULL)
    fn detach_row(&self, kind: EntityKind, row_id: i64, replacement: Option<i64>) -> SyncResult<()> {
        let table = kind.table();
        self.conn
            .execute(
                "DELETE FROM record_links WHERE owner_table = ?1 AND owner_row = ?2",
                params![table, row_id],
            )
            .map_err(self.write_err())?;
        self.conn
            .execute(
                "UPDATE record_links SET target_row = ?1 WHERE target_table = ?2 AND target_row = ?3",
                params![replacement, table, row_id],
            )
            .map_err(self.write_err())?;
        Ok(())
    }

    /// Record identities written by the bulk path, which skips `insert_entity`
    pub(crate) fn note_bulk_inserted<'a>(&mut self, kind: EntityKind, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.delta.record_insert(kind, id);
        }
    }

    pub(crate) fn in_unit(&self) -> bool {
        self.unit.is_some()
    }

    pub(crate) fn ensure_unit(&self) -> SyncResult<()> {
        self.ensure_writable()
    }

    // ========================================================================
    // UNITS OF WORK
    // ========================================================================

    pub(crate) fn begin_unit(&mut self, operation: &str) -> SyncResult<()> {
        if let Some(open) = &self.unit {
            return Err(SyncError::aborted(format!(
                "'{}' started while '{}' is still open",
                operation, open
            )));
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|source| SyncError::CommitFailure {
                operation: operation.to_string(),
                source,
            })?;
        self.unit = Some(operation.to_string());
        self.delta = ChangeDelta::new(&self.name);
        Ok(())
    }

    /// Journal and commit the open unit. On failure everything rolls back.
    pub(crate) fn commit_unit(&mut self) -> SyncResult<ChangeDelta> {
        let operation = self.unit.clone().unwrap_or_default();
        let mut delta = std::mem::replace(&mut self.delta, ChangeDelta::new(&self.name));

        let result = (|| -> SyncResult<()> {
            if !delta.is_empty() {
                delta.commit_id = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let (inserted, updated, deleted) = delta.counts();
                let summary = serde_json::json!({
                    "inserted": inserted,
                    "updated": updated,
                    "deleted": deleted,
                    "kinds": delta.kinds.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
                });
                self.conn
                    .execute(
                        "INSERT INTO events (commit_id, operation, source, summary, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            delta.commit_id as i64,
                            operation,
                            self.name.as_ref(),
                            summary.to_string(),
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .map_err(self.write_err())?;
            }
            self.conn.execute_batch("COMMIT").map_err(self.write_err())?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.unit = None;
                debug!(context = %self.name, operation = %operation, commit_id = delta.commit_id, "unit committed");
                Ok(delta)
            }
            Err(e) => {
                self.rollback_unit();
                Err(e)
            }
        }
    }

    /// Discard the open unit. Cached records may reflect rolled-back writes,
    /// so the whole cache is dropped.
    pub(crate) fn rollback_unit(&mut self) {
        if self.conn.is_autocommit() {
            // SQLite already rolled back (e.g. after a failed COMMIT)
        } else if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(context = %self.name, error = %e, "rollback failed");
        }
        if let Some(operation) = self.unit.take() {
            debug!(context = %self.name, operation = %operation, "unit rolled back");
        }
        self.delta = ChangeDelta::new(&self.name);
        self.cache.clear();
    }

    // ========================================================================
    // READ-SIDE STATE (reader context)
    // ========================================================================

    pub(crate) fn is_cached(&self, kind: EntityKind, id: &str) -> bool {
        self.cache.contains_key(&(kind, id.to_string()))
    }

    pub(crate) fn evict(&mut self, kind: EntityKind, id: &str) -> bool {
        self.cache.remove(&(kind, id.to_string())).is_some()
    }

    /// Re-read a cached record from committed state. Returns false if it was evicted.
    pub(crate) fn refresh(&mut self, kind: EntityKind, id: &str) -> bool {
        let key = (kind, id.to_string());
        match self.fetch_record(kind, id) {
            Ok(Some(record)) => {
                self.cache.insert(key, record);
                true
            }
            Ok(None) => {
                self.cache.remove(&key);
                false
            }
            Err(e) => {
                warn!(context = %self.name, %kind, id, error = %e, "refresh failed, evicting");
                self.cache.remove(&key);
                false
            }
        }
    }

    /// Record `commit_id` as merged. False if it already was.
    ///
    /// Commit ids are allocated in order, so a contiguous run folds into
    /// `merged_floor`. An id taken by a commit that then failed never arrives;
    /// once more than `MERGE_WINDOW` ids wait above such a gap the floor skips it.
    pub(crate) fn mark_merged(&mut self, commit_id: u64) -> bool {
        if commit_id <= self.merged_floor || !self.merged_recent.insert(commit_id) {
            return false;
        }
        loop {
            while self.merged_recent.remove(&(self.merged_floor + 1)) {
                self.merged_floor += 1;
            }
            if self.merged_recent.len() <= MERGE_WINDOW {
                break;
            }
            if let Some(oldest) = self.merged_recent.pop_first() {
                self.merged_floor = oldest;
            }
        }
        true
    }

    pub(crate) fn store_snapshot(&mut self, kind: EntityKind, records: Vec<FieldMap>) {
        self.snapshots.insert(kind, records);
    }

    pub(crate) fn snapshot(&self, kind: EntityKind) -> Option<&Vec<FieldMap>> {
        self.snapshots.get(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_session(last_commit: u64) -> Session {
        Session::new(
            Arc::from("reader"),
            ContextRole::Reader,
            Connection::open_in_memory().unwrap(),
            StoreConfig::new("unused.db"),
            Arc::new(AtomicU64::new(last_commit)),
            last_commit,
        )
    }

    #[test]
    fn test_out_of_order_merges_fold_into_floor() {
        let mut session = create_test_session(0);
        assert!(session.mark_merged(2));
        assert!(session.mark_merged(1));
        assert!(!session.mark_merged(2));
        assert_eq!(session.merged_floor, 2);
        assert!(session.merged_recent.is_empty());
    }

    #[test]
    fn test_commits_before_open_count_as_merged() {
        let mut session = create_test_session(7);
        assert!(!session.mark_merged(7));
        assert!(session.mark_merged(8));
    }

    #[test]
    fn test_gap_from_failed_commit_stays_bounded() {
        let mut session = create_test_session(0);
        // Commit 1 took its id and failed; it is never merged
        for id in 2..(MERGE_WINDOW as u64 + 100) {
            assert!(session.mark_merged(id));
        }
        assert!(session.merged_recent.len() <= MERGE_WINDOW);
        assert!(!session.mark_merged(1));
        assert!(!session.mark_merged(50));
    }
}
