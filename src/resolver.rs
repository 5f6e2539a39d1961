// 🔗 Reference Resolver - soft identity keys → live links
//
// Single lookups go by key, limited to one row. Reconciliation and relink
// passes prefetch every referenced key in one batched pass instead, so no bulk
// path ever does a per-entity lookup. A missing target is not an error: the
// link row is written with a NULL target and the referrer's payload keeps the
// soft key.

use crate::config::{StoreConfig, MAX_LOOKUP_CHUNK};
use crate::entities::{
    Account, Aggregate, Category, DomainEntity, EntityKind, Link, RecurringOccurrence, RecurringSeries,
    Reference, Transaction,
};
use crate::error::{SyncError, SyncResult};
use crate::store::Session;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;
use tracing::{debug, info};

/// A resolved target row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveLink {
    pub kind: EntityKind,
    pub row_id: i64,
}

/// Key → first row id, for every reference target found in a prefetch pass
#[derive(Debug, Default)]
pub struct ResolvedIndex {
    rows: HashMap<(EntityKind, String), i64>,
}

impl ResolvedIndex {
    pub fn get(&self, kind: EntityKind, key: &str) -> Option<LiveLink> {
        self.rows
            .get(&(kind, key.to_string()))
            .map(|row_id| LiveLink { kind, row_id: *row_id })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Links written by a wiring pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireStats {
    pub linked: usize,
    pub dangling: usize,
}

impl AddAssign for WireStats {
    fn add_assign(&mut self, other: Self) {
        self.linked += other.linked;
        self.dangling += other.dangling;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver {
    chunk_size: usize,
}

impl ReferenceResolver {
    pub fn new(chunk_size: usize) -> Self {
        ReferenceResolver {
            chunk_size: chunk_size.clamp(1, MAX_LOOKUP_CHUNK),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.lookup_chunk_size)
    }

    /// Resolve one key. Lowest row wins if the key is (still) duplicated.
    pub fn resolve(&self, session: &Session, key: &str, kind: EntityKind) -> SyncResult<Option<LiveLink>> {
        let row_id: Option<i64> = session
            .connection()
            .prepare_cached(&format!(
                "SELECT row_id FROM {} WHERE id = ?1 ORDER BY row_id LIMIT 1",
                kind.table()
            ))
            .and_then(|mut stmt| stmt.query_row([key], |row| row.get(0)).optional())
            .map_err(SyncError::query(kind))?;
        Ok(row_id.map(|row_id| LiveLink { kind, row_id }))
    }

    /// Resolve a single entity's references one key at a time. Narrow paths only.
    pub fn resolve_each(&self, session: &Session, refs: &[Reference]) -> SyncResult<ResolvedIndex> {
        let mut index = ResolvedIndex::default();
        for reference in refs {
            if let Some(link) = self.resolve(session, &reference.key, reference.target)? {
                index.rows.insert((link.kind, reference.key.clone()), link.row_id);
            }
        }
        Ok(index)
    }

    /// Fetch every referenced target in chunked `IN` queries, one pass per kind
    pub fn prefetch<'a>(
        &self,
        session: &Session,
        refs: impl IntoIterator<Item = &'a Reference>,
    ) -> SyncResult<ResolvedIndex> {
        let mut wanted: BTreeMap<EntityKind, BTreeSet<&str>> = BTreeMap::new();
        for reference in refs {
            wanted.entry(reference.target).or_default().insert(reference.key.as_str());
        }

        let mut index = ResolvedIndex::default();
        for (kind, keys) in wanted {
            let keys: Vec<&str> = keys.into_iter().collect();
            for chunk in keys.chunks(self.chunk_size) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let mut stmt = session
                    .connection()
                    .prepare(&format!(
                        "SELECT id, MIN(row_id) FROM {} WHERE id IN ({}) GROUP BY id",
                        kind.table(),
                        placeholders
                    ))
                    .map_err(SyncError::query(kind))?;
                let found = stmt
                    .query_map(params_from_iter(chunk.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                    .map_err(SyncError::query(kind))?;
                for (key, row_id) in found {
                    index.rows.insert((kind, key), row_id);
                }
            }
        }

        debug!(resolved = index.len(), "reference targets prefetched");
        Ok(index)
    }

    /// Replace an owner's outgoing links with ones built from `refs`.
    ///
    /// Targets absent from `index` get a dangling link (NULL row) that still
    /// records the soft key.
    pub(crate) fn wire(
        &self,
        session: &mut Session,
        owner_kind: EntityKind,
        owner_row: i64,
        refs: &[Reference],
        index: &ResolvedIndex,
    ) -> SyncResult<WireStats> {
        session.ensure_unit()?;
        let conn = session.connection();
        let on_err = session.write_err();

        conn.prepare_cached("DELETE FROM record_links WHERE owner_table = ?1 AND owner_row = ?2")
            .and_then(|mut stmt| stmt.execute(params![owner_kind.table(), owner_row]))
            .map_err(&on_err)?;

        let mut stats = WireStats::default();
        let mut insert = conn
            .prepare_cached(
                "INSERT INTO record_links (owner_table, owner_row, ref_name, target_table, target_key, target_row)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(&on_err)?;
        for reference in refs {
            let target = index.get(reference.target, &reference.key);
            insert
                .execute(params![
                    owner_kind.table(),
                    owner_row,
                    reference.name,
                    reference.target.table(),
                    reference.key,
                    target.map(|link| link.row_id),
                ])
                .map_err(&on_err)?;
            if target.is_some() {
                stats.linked += 1;
            } else {
                stats.dangling += 1;
            }
        }
        Ok(stats)
    }

    /// Identity key behind a live link, or None when the link is dangling or absent
    pub fn live_target(
        &self,
        session: &Session,
        owner_kind: EntityKind,
        owner_id: &str,
        ref_name: &str,
    ) -> SyncResult<Option<String>> {
        session
            .connection()
            .prepare_cached(&format!(
                "SELECT l.target_key FROM record_links l
                 JOIN {} o ON o.row_id = l.owner_row
                 WHERE l.owner_table = ?1 AND o.id = ?2 AND l.ref_name = ?3 AND l.target_row IS NOT NULL
                 ORDER BY o.row_id LIMIT 1",
                owner_kind.table()
            ))
            .and_then(|mut stmt| {
                stmt.query_row(params![owner_kind.table(), owner_id, ref_name], |row| row.get(0))
                    .optional()
            })
            .map_err(SyncError::query(owner_kind))
    }

    /// Re-wire every owner of `T` that has a dangling or missing link, in one
    /// batched pass. Picks up targets created after the owner and rows written
    /// by the bulk path.
    pub fn relink_dangling<T: DomainEntity>(&self, session: &mut Session) -> SyncResult<WireStats> {
        session.ensure_unit()?;
        let kind = T::KIND;

        let existing: HashMap<(i64, String), Option<i64>> = {
            let mut stmt = session
                .connection()
                .prepare_cached("SELECT owner_row, ref_name, target_row FROM record_links WHERE owner_table = ?1")
                .map_err(SyncError::query(kind))?;
            let rows = stmt
                .query_map([kind.table()], |row| Ok(((row.get(0)?, row.get(1)?), row.get(2)?)))
                .and_then(|rows| rows.collect::<Result<HashMap<(i64, String), Option<i64>>, _>>())
                .map_err(SyncError::query(kind))?;
            rows
        };

        let mut pending: Vec<(i64, Vec<Reference>)> = Vec::new();
        for record in session.fetch_records(kind, None)? {
            let refs = record.decode::<T>()?.references();
            let needs_wiring = refs.iter().any(|r| {
                !matches!(existing.get(&(record.row_id, r.name.to_string())), Some(Some(_)))
            });
            if needs_wiring {
                pending.push((record.row_id, refs));
            }
        }
        if pending.is_empty() {
            return Ok(WireStats::default());
        }

        let index = self.prefetch(session, pending.iter().flat_map(|(_, refs)| refs.iter()))?;
        let mut stats = WireStats::default();
        for (owner_row, refs) in &pending {
            stats += self.wire(session, kind, *owner_row, refs, &index)?;
        }

        info!(%kind, owners = pending.len(), linked = stats.linked, dangling = stats.dangling, "relinked");
        Ok(stats)
    }

    /// `relink_dangling` over every entity kind
    pub fn relink_all(&self, session: &mut Session) -> SyncResult<WireStats> {
        let mut stats = WireStats::default();
        for kind in EntityKind::ALL {
            stats += match kind {
                EntityKind::Account => self.relink_dangling::<Account>(session)?,
                EntityKind::Transaction => self.relink_dangling::<Transaction>(session)?,
                EntityKind::Category => self.relink_dangling::<Category>(session)?,
                EntityKind::RecurringSeries => self.relink_dangling::<RecurringSeries>(session)?,
                EntityKind::RecurringOccurrence => self.relink_dangling::<RecurringOccurrence>(session)?,
                EntityKind::Aggregate => self.relink_dangling::<Aggregate>(session)?,
                EntityKind::Link => self.relink_dangling::<Link>(session)?,
            };
        }
        Ok(stats)
    }
}
