// 📥 Bulk Importer - create-only batches through a low-level insert path
//
// For records known to be new (historical imports): no identity check, no
// update path, no per-record lifecycle. Derived columns (sort key, fingerprint)
// are computed up front by `prepare_rows`; the insert itself only copies them.
// Live links are not wired here; `ReferenceResolver::relink_dangling` picks
// them up later and readers fall back to the soft keys meanwhile.

use crate::coordinator::{SaveCoordinator, SaveOutcome};
use crate::entities::{DerivedColumns, DomainEntity, EntityKind};
use crate::error::{SyncError, SyncResult};
use crate::propagation::MergeOutcome;
use crate::store::{encode_fields, Session};
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info};

/// One row ready for insertion: payload already serialized, derived columns filled
#[derive(Debug, Clone)]
pub struct BulkRow {
    pub id: String,
    pub payload: String,
    pub derived: DerivedColumns,
}

/// Serialize entities and compute their derived columns explicitly
pub fn prepare_rows<T: DomainEntity>(entities: &[T]) -> SyncResult<Vec<BulkRow>> {
    entities
        .iter()
        .map(|entity| {
            Ok(BulkRow {
                id: entity.id().to_string(),
                payload: serde_json::to_string(&encode_fields(entity)?)?,
                derived: entity.derived(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkStats {
    pub inserted: usize,
    pub batches: usize,
}

/// Insert prepared rows in batches of `batch_size`, inside the open unit
pub(crate) fn write_rows(
    session: &mut Session,
    kind: EntityKind,
    rows: &[BulkRow],
    batch_size: usize,
) -> SyncResult<BulkStats> {
    session.ensure_unit()?;
    let mut stats = BulkStats::default();
    if rows.is_empty() {
        return Ok(stats);
    }

    let now = Utc::now().to_rfc3339();
    {
        let on_err = session.write_err();
        let mut insert = session
            .connection()
            .prepare_cached(&format!(
                "INSERT INTO {} (id, payload, sort_key, fingerprint, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                kind.table()
            ))
            .map_err(&on_err)?;

        for batch in rows.chunks(batch_size.max(1)) {
            for row in batch {
                insert
                    .execute(params![row.id, row.payload, row.derived.sort_key, row.derived.fingerprint, now])
                    .map_err(&on_err)?;
            }
            stats.batches += 1;
            stats.inserted += batch.len();
            debug!(%kind, batch = stats.batches, rows = batch.len(), "bulk batch written");
        }
    }

    session.note_bulk_inserted(kind, rows.iter().map(|row| row.id.as_str()));
    Ok(stats)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub batches: usize,
    pub commit_id: Option<u64>,
    pub merge: MergeOutcome,
}

#[derive(Clone)]
pub struct BulkImporter {
    coordinator: SaveCoordinator,
    batch_size: usize,
}

impl BulkImporter {
    pub fn new(coordinator: SaveCoordinator, batch_size: usize) -> Self {
        BulkImporter {
            coordinator,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Insert known-new records in one save operation. The reader reflects
    /// the new identities by the time this returns.
    pub async fn bulk_insert<T: DomainEntity>(&self, records: Vec<T>) -> SyncResult<BulkInsertReport> {
        if records.is_empty() {
            return Err(SyncError::aborted(format!("empty bulk insert of {}", T::KIND)));
        }
        let rows = prepare_rows(&records)?;
        let batch_size = self.batch_size;

        let SaveOutcome { value, delta, merge } = self
            .coordinator
            .perform(&format!("bulk insert {}", T::KIND), move |session| {
                write_rows(session, T::KIND, &rows, batch_size)
            })
            .await?;

        info!(
            kind = %T::KIND,
            inserted = value.inserted,
            batches = value.batches,
            commit_id = delta.commit_id,
            "bulk insert committed"
        );
        Ok(BulkInsertReport {
            inserted: value.inserted,
            batches: value.batches,
            commit_id: (!delta.is_empty()).then_some(delta.commit_id),
            merge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{SoftRef, Transaction};
    use crate::reconciliation::{ReconciliationEngine, Scope};
    use crate::resolver::ReferenceResolver;
    use crate::store::test_support::temp_store;
    use chrono::NaiveDate;

    fn create_test_transactions(n: usize) -> Vec<Transaction> {
        (0..n)
            .map(|i| {
                Transaction::new(
                    format!("t{}", i),
                    NaiveDate::from_ymd_opt(2024, 1 + (i % 12) as u32, 1).unwrap(),
                    -(i as f64) - 1.0,
                    format!("Purchase {}", i),
                    SoftRef::new("1", "Checking"),
                )
            })
            .collect()
    }

    #[test]
    fn test_prepare_rows_fills_derived_columns() {
        let rows = prepare_rows(&create_test_transactions(2)).unwrap();
        assert_eq!(rows[0].derived.sort_key.as_deref(), Some("2024-01"));
        assert_eq!(rows[1].derived.sort_key.as_deref(), Some("2024-02"));
        assert!(rows.iter().all(|r| r.derived.fingerprint.is_some()));
    }

    #[tokio::test]
    async fn test_bulk_insert_batches_and_propagates() {
        let (_dir, store) = temp_store();
        let importer = BulkImporter::new(store.coordinator("import").unwrap(), 4);

        let report = importer.bulk_insert(create_test_transactions(10)).await.unwrap();

        assert_eq!(report.inserted, 10);
        assert_eq!(report.batches, 3);
        assert_eq!(report.commit_id, Some(1));
        assert!(matches!(report.merge, MergeOutcome::Applied { .. }));
        assert_eq!(store.reader().count(EntityKind::Transaction).await.unwrap(), 10);
        let tx: Option<Transaction> = store.reader().fetch("t9").await.unwrap();
        assert!(tx.is_some());
    }

    #[tokio::test]
    async fn test_bulk_insert_rejects_empty_batch() {
        let (_dir, store) = temp_store();
        let importer = BulkImporter::new(store.coordinator("import").unwrap(), 4);
        let result = importer.bulk_insert(Vec::<Transaction>::new()).await;
        assert!(matches!(result, Err(SyncError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_bulk_matches_reconciled_creates() {
        let (_dir, bulk_store) = temp_store();
        let (_dir2, sync_store) = temp_store();
        let records = create_test_transactions(6);

        BulkImporter::new(bulk_store.coordinator("import").unwrap(), 2)
            .bulk_insert(records.clone())
            .await
            .unwrap();

        let engine = ReconciliationEngine::new(ReferenceResolver::new(100));
        let one_by_one = records.clone();
        sync_store
            .coordinator("sync")
            .unwrap()
            .perform("create", move |session| {
                for record in &one_by_one {
                    engine.sync(std::slice::from_ref(record), &Scope::keys([record.id.clone()]), session)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let read = |store: &crate::store::Store| {
            let reader = store.reader();
            async move {
                reader
                    .perform_read(|session| {
                        let mut rows: Vec<(String, String, Option<String>, Option<String>)> = session
                            .fetch_records(EntityKind::Transaction, None)?
                            .into_iter()
                            .map(|r| (r.id, serde_json::to_string(&r.fields).unwrap(), r.sort_key, r.fingerprint))
                            .collect();
                        rows.sort();
                        Ok(rows)
                    })
                    .await
                    .unwrap()
            }
        };
        assert_eq!(read(&bulk_store).await, read(&sync_store).await);
    }
}
