// 🏭 Upstream producers - recurring generation and aggregate recompute
//
// Both hand their output to the reconciliation engine inside one save
// operation, so a generated batch or a recomputed month lands atomically.

use crate::coordinator::SaveCoordinator;
use crate::entities::{Aggregate, GeneratedBatch};
use crate::error::SyncResult;
use crate::reconciliation::{ReconciliationEngine, Scope, SyncReport};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecurringReport {
    pub transactions: usize,
    pub occurrences: usize,
    pub commit_id: Option<u64>,
}

/// Persist one generator pass: new transactions and occurrences plus the
/// series with its advanced `last_generated` marker.
///
/// Identities derive from (series, date), so committing an overlapping pass
/// again creates nothing new.
pub async fn commit_recurring(
    coordinator: &SaveCoordinator,
    engine: ReconciliationEngine,
    batch: GeneratedBatch,
) -> SyncResult<RecurringReport> {
    if batch.is_empty() {
        return Ok(RecurringReport::default());
    }
    let series_id = batch.series.id.clone();

    let outcome = coordinator
        .perform(&format!("generate {}", series_id), move |session| {
            engine.upsert(&batch.series, session)?;
            let transactions = engine.insert_missing(&batch.transactions, session)?;
            let occurrences = engine.insert_missing(&batch.occurrences, session)?;
            Ok((transactions, occurrences))
        })
        .await?;

    let (transactions, occurrences) = outcome.value;
    info!(series = %series_id, transactions, occurrences, "recurring batch committed");
    Ok(RecurringReport {
        transactions,
        occurrences,
        commit_id: outcome.commit_id(),
    })
}

/// Reconcile a full or partial rollup target set (e.g. one month under
/// `Scope::Keys`). Aggregates in scope but missing from `targets` are deleted.
pub async fn commit_aggregates(
    coordinator: &SaveCoordinator,
    engine: ReconciliationEngine,
    targets: Vec<Aggregate>,
    scope: Scope,
) -> SyncResult<SyncReport> {
    let outcome = coordinator
        .perform("recompute aggregates", move |session| engine.sync(&targets, &scope, session))
        .await?;
    Ok(outcome.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        generate_occurrences, AggregateKey, EntityKind, Frequency, RecurringOccurrence, RecurringSeries, SoftRef,
        TransactionKind,
    };
    use crate::resolver::ReferenceResolver;
    use crate::store::test_support::temp_store;
    use chrono::NaiveDate;

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(ReferenceResolver::new(100))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn create_test_series() -> RecurringSeries {
        RecurringSeries {
            id: "rent".to_string(),
            name: "Rent".to_string(),
            amount: -1200.0,
            kind: TransactionKind::Expense,
            frequency: Frequency::Monthly,
            start_date: date(2024, 1, 1),
            account: SoftRef::new("1", "Checking"),
            category: None,
            last_generated: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_recurring_pass_commits_and_links_occurrences() {
        let (_dir, store) = temp_store();
        let coordinator = store.coordinator("recurring").unwrap();

        let batch = generate_occurrences(&create_test_series(), date(2024, 3, 15));
        let report = commit_recurring(&coordinator, engine(), batch).await.unwrap();

        assert_eq!(report.transactions, 3);
        assert_eq!(report.occurrences, 3);
        let reader = store.reader();
        let series: RecurringSeries = reader.fetch("rent").await.unwrap().unwrap();
        assert_eq!(series.last_generated, Some(date(2024, 3, 1)));
        assert_eq!(
            reader
                .live_link(EntityKind::RecurringOccurrence, "rent:2024-02-01", "transaction")
                .await
                .unwrap(),
            Some("rent:tx:2024-02-01".to_string())
        );
        let occurrence: Option<RecurringOccurrence> = reader.fetch("rent:2024-03-01").await.unwrap();
        assert!(occurrence.is_some());
    }

    #[tokio::test]
    async fn test_regenerating_same_range_creates_nothing() {
        let (_dir, store) = temp_store();
        let coordinator = store.coordinator("recurring").unwrap();
        let series = create_test_series();

        commit_recurring(&coordinator, engine(), generate_occurrences(&series, date(2024, 2, 1)))
            .await
            .unwrap();
        // Stale series without the advanced marker regenerates the same dates
        let again = commit_recurring(&coordinator, engine(), generate_occurrences(&series, date(2024, 2, 1)))
            .await
            .unwrap();

        assert_eq!(again.transactions, 0);
        assert_eq!(again.occurrences, 0);
        assert_eq!(store.reader().count(EntityKind::Transaction).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_aggregate_recompute_keeps_other_months() {
        let (_dir, store) = temp_store();
        let coordinator = store.coordinator("rollup").unwrap();

        let january = Aggregate::new(AggregateKey::monthly("food", 2024, 1), 100.0, 4);
        let february = Aggregate::new(AggregateKey::monthly("food", 2024, 2), 80.0, 3);
        let february_daily = Aggregate::new(AggregateKey::monthly("food", 2024, 2).with_day(3), 20.0, 1);
        commit_aggregates(
            &coordinator,
            engine(),
            vec![january.clone(), february.clone(), february_daily.clone()],
            Scope::Full,
        )
        .await
        .unwrap();

        // Recompute February only: the daily bucket disappeared upstream
        let recomputed = Aggregate::new(AggregateKey::monthly("food", 2024, 2), 95.0, 4);
        let report = commit_aggregates(
            &coordinator,
            engine(),
            vec![recomputed],
            Scope::keys([february.id.clone(), february_daily.id.clone()]),
        )
        .await
        .unwrap();

        assert_eq!(report.applied.updated, 1);
        assert_eq!(report.applied.deleted, 1);
        let reader = store.reader();
        assert_eq!(reader.count(EntityKind::Aggregate).await.unwrap(), 2);
        let kept: Aggregate = reader.fetch(&january.id).await.unwrap().unwrap();
        assert_eq!(kept.total, 100.0);
    }
}
