// 📄 CSV Import Pipeline
//
// CSV rows → candidate transactions plus the accounts/categories they name →
// Duplicate Detector → Bulk Importer, all in one save operation.
//
// Expected columns: Date, Description, Amount, Account, Category (optional).
// Dates are YYYY-MM-DD or MM/DD/YYYY; amounts may carry "$" and thousands
// separators.

use crate::bulk::{prepare_rows, write_rows, BulkStats};
use crate::coordinator::{SaveCoordinator, SaveOutcome};
use crate::deduplication::{normalize_text, DuplicateDetector};
use crate::entities::{Account, Category, DomainEntity, SoftRef, Transaction};
use crate::error::{SyncError, SyncResult};
use crate::propagation::MergeOutcome;
use crate::reconciliation::ReconciliationEngine;
use crate::store::Session;
use chrono::NaiveDate;
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CsvRow {
    #[serde(rename = "Date", alias = "date")]
    pub date: String,
    #[serde(rename = "Description", alias = "description")]
    pub description: String,
    #[serde(rename = "Amount", alias = "amount")]
    pub amount: String,
    #[serde(rename = "Account", alias = "account")]
    pub account: String,
    #[serde(rename = "Category", alias = "category", default)]
    pub category: Option<String>,
}

/// Read every row of a CSV file
pub fn load_csv(path: &Path) -> SyncResult<Vec<CsvRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        rows.push(result?);
    }
    Ok(rows)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, '$' | ',' | ' ')).collect();
    cleaned.parse().ok()
}

// ============================================================================
// IMPORT BATCH
// ============================================================================

/// Ordered candidates plus every account/category they mention
#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    pub transactions: Vec<Transaction>,
    pub accounts: Vec<Account>,
    pub categories: Vec<Category>,
}

impl ImportBatch {
    /// Turn CSV rows into candidates. Line numbers in errors count the header.
    ///
    /// Accounts and categories get name-derived keys here; `ImportPipeline::run`
    /// swaps in the key of a persisted entity with the same name.
    pub fn from_rows(rows: Vec<CsvRow>) -> SyncResult<Self> {
        let mut accounts: BTreeMap<String, Account> = BTreeMap::new();
        let mut categories: BTreeMap<String, Category> = BTreeMap::new();
        let mut transactions = Vec::with_capacity(rows.len());

        for (i, row) in rows.into_iter().enumerate() {
            let line = i + 2;
            let date = parse_date(&row.date).ok_or_else(|| SyncError::InvalidRecord {
                line,
                reason: format!("unparseable date '{}'", row.date),
            })?;
            let amount = parse_amount(&row.amount).ok_or_else(|| SyncError::InvalidRecord {
                line,
                reason: format!("unparseable amount '{}'", row.amount),
            })?;
            if row.account.is_empty() {
                return Err(SyncError::InvalidRecord {
                    line,
                    reason: "missing account".to_string(),
                });
            }

            let account_key = Account::key_for_name(&row.account);
            accounts
                .entry(account_key.clone())
                .or_insert_with(|| Account::new(account_key.clone(), row.account.clone()));

            let mut tx = Transaction::new(
                Uuid::new_v4().to_string(),
                date,
                amount,
                row.description,
                SoftRef::new(account_key, row.account),
            );

            if let Some(name) = row.category.filter(|name| !name.is_empty()) {
                let category_key = Category::key_for_name(&name);
                categories
                    .entry(category_key.clone())
                    .or_insert_with(|| Category::new(category_key.clone(), name.clone()));
                tx = tx.with_category(SoftRef::new(category_key, name));
            }
            transactions.push(tx);
        }

        Ok(ImportBatch {
            transactions,
            accounts: accounts.into_values().collect(),
            categories: categories.into_values().collect(),
        })
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub candidates: usize,
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub new_accounts: usize,
    pub new_categories: usize,
    pub batches: usize,
    pub commit_id: Option<u64>,
}

impl ImportReport {
    pub fn summary(&self) -> String {
        format!(
            "{} candidates: {} imported, {} duplicates skipped, {} new accounts, {} new categories",
            self.candidates, self.imported, self.skipped_duplicates, self.new_accounts, self.new_categories
        )
    }
}

#[derive(Clone)]
pub struct ImportPipeline {
    coordinator: SaveCoordinator,
    engine: ReconciliationEngine,
    batch_size: usize,
}

impl ImportPipeline {
    pub fn new(coordinator: SaveCoordinator, engine: ReconciliationEngine, batch_size: usize) -> Self {
        ImportPipeline {
            coordinator,
            engine,
            batch_size: batch_size.max(1),
        }
    }

    /// Import one batch. Names already persisted reuse that account/category;
    /// the rest are created first so the candidates' soft keys have targets.
    /// Duplicates (against the store and within the batch) are skipped and
    /// counted.
    pub async fn run(&self, mut batch: ImportBatch) -> SyncResult<(ImportReport, MergeOutcome)> {
        let engine = self.engine;
        let batch_size = self.batch_size;
        let candidates = batch.transactions.len();

        let SaveOutcome { value, delta, merge } = self
            .coordinator
            .perform("import csv", move |session| {
                adopt_existing(&mut batch, session)?;
                let new_accounts = engine.insert_missing(&batch.accounts, session)?;
                let new_categories = engine.insert_missing(&batch.categories, session)?;

                let mut detector = DuplicateDetector::new(session.fingerprints()?);
                let outcome = detector.filter(batch.transactions);
                let rows = prepare_rows(&outcome.accepted)?;
                let stats: BulkStats = write_rows(session, Transaction::KIND, &rows, batch_size)?;

                Ok((new_accounts, new_categories, stats, outcome.skipped_count()))
            })
            .await?;

        let (new_accounts, new_categories, stats, skipped_duplicates) = value;
        let report = ImportReport {
            candidates,
            imported: stats.inserted,
            skipped_duplicates,
            new_accounts,
            new_categories,
            batches: stats.batches,
            commit_id: (!delta.is_empty()).then_some(delta.commit_id),
        };
        info!(
            imported = report.imported,
            skipped_duplicates = report.skipped_duplicates,
            new_accounts = report.new_accounts,
            "import finished"
        );
        Ok((report, merge))
    }
}

/// Normalized name → soft reference of the first persisted entity carrying it
fn persisted_names<T: DomainEntity>(
    session: &Session,
    name_of: impl Fn(&T) -> &str,
) -> SyncResult<HashMap<String, SoftRef>> {
    let mut names = HashMap::new();
    for record in session.fetch_records(T::KIND, None)? {
        let entity: T = record.decode()?;
        let name = name_of(&entity);
        names
            .entry(normalize_text(name))
            .or_insert_with(|| SoftRef::new(entity.id(), name));
    }
    Ok(names)
}

/// Re-point candidates at persisted accounts/categories whose name matches,
/// so "Checking" in a CSV lands on the account the user already has. Runs
/// before fingerprinting, which keys on the account.
fn adopt_existing(batch: &mut ImportBatch, session: &Session) -> SyncResult<()> {
    let accounts = persisted_names::<Account>(session, |a| a.name.as_str())?;
    let categories = persisted_names::<Category>(session, |c| c.name.as_str())?;

    batch.accounts.retain(|a| !accounts.contains_key(&normalize_text(&a.name)));
    batch.categories.retain(|c| !categories.contains_key(&normalize_text(&c.name)));

    for tx in &mut batch.transactions {
        if let Some(existing) = accounts.get(&normalize_text(&tx.account.name)) {
            tx.account = existing.clone();
        }
        if let Some(category) = tx.category.as_mut() {
            if let Some(existing) = categories.get(&normalize_text(&category.name)) {
                *category = existing.clone();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;
    use crate::resolver::ReferenceResolver;
    use crate::store::test_support::temp_store;
    use crate::store::Store;
    use std::io::Write;

    fn pipeline(store: &Store) -> ImportPipeline {
        ImportPipeline::new(
            store.coordinator("import").unwrap(),
            ReconciliationEngine::new(ReferenceResolver::new(100)),
            100,
        )
    }

    fn create_test_row(date: &str, description: &str, amount: &str, account: &str) -> CsvRow {
        CsvRow {
            date: date.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
            account: account.to_string(),
            category: Some("Food".to_string()),
        }
    }

    #[test]
    fn test_load_csv_reads_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,Description,Amount,Account,Category").unwrap();
        writeln!(file, "2024-01-05,Coffee,-4.50,Checking,Food").unwrap();
        writeln!(file, "01/06/2024,\"Salary, January\",\"$1,200.00\",Checking,").unwrap();

        let rows = load_csv(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].description, "Salary, January");

        let batch = ImportBatch::from_rows(rows).unwrap();
        assert_eq!(batch.transactions[1].amount, 1200.0);
        assert_eq!(batch.transactions[1].date, NaiveDate::from_ymd_opt(2024, 1, 6).unwrap());
        assert!(batch.transactions[1].category.is_none());
        assert_eq!(batch.accounts.len(), 1);
        assert_eq!(batch.categories.len(), 1);
    }

    #[test]
    fn test_bad_date_reports_line() {
        let rows = vec![
            create_test_row("2024-01-05", "Coffee", "-4.50", "Checking"),
            create_test_row("yesterday", "Coffee", "-4.50", "Checking"),
        ];
        let err = ImportBatch::from_rows(rows).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord { line: 3, .. }));
    }

    #[tokio::test]
    async fn test_import_creates_accounts_and_skips_repeats() {
        let (_dir, store) = temp_store();
        let rows = vec![
            create_test_row("2024-01-05", "Coffee", "-4.50", "Checking"),
            create_test_row("2024-01-05", "  COFFEE ", "-4.50", "checking"),
            create_test_row("2024-01-06", "Lunch", "-12.00", "Checking"),
        ];

        let (report, merge) = pipeline(&store).run(ImportBatch::from_rows(rows).unwrap()).await.unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.new_accounts, 1);
        assert_eq!(report.new_categories, 1);
        assert!(matches!(merge, MergeOutcome::Applied { .. }));
        assert_eq!(store.reader().count(EntityKind::Transaction).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_import_reuses_account_with_same_name() {
        let (_dir, store) = temp_store();
        let engine = ReconciliationEngine::new(ReferenceResolver::new(100));
        store
            .coordinator("ui")
            .unwrap()
            .perform("seed", move |session| {
                engine.sync(&[Account::new("1", "Checking")], &crate::reconciliation::Scope::Full, session)?;
                let coffee = Transaction::new(
                    "existing",
                    NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                    -4.5,
                    "Coffee",
                    SoftRef::new("1", "Checking"),
                );
                engine.insert_missing(&[coffee], session)
            })
            .await
            .unwrap();

        let rows = vec![
            create_test_row("2024-01-05", "coffee", "-4.50", "CHECKING"),
            create_test_row("2024-01-06", "Lunch", "-12.00", "checking"),
        ];
        let (report, _) = pipeline(&store).run(ImportBatch::from_rows(rows).unwrap()).await.unwrap();

        assert_eq!(report.new_accounts, 0);
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.imported, 1);
        let reader = store.reader();
        assert_eq!(reader.count(EntityKind::Account).await.unwrap(), 1);
        let lunch = reader
            .fetch_all::<Transaction>()
            .await
            .unwrap()
            .into_inner()
            .into_iter()
            .find(|tx| tx.description == "Lunch")
            .unwrap();
        assert_eq!(lunch.account, SoftRef::new("1", "Checking"));
    }

    #[tokio::test]
    async fn test_reimport_of_same_file_imports_nothing() {
        let (_dir, store) = temp_store();
        let rows = vec![
            create_test_row("2024-01-05", "Coffee", "-4.50", "Checking"),
            create_test_row("2024-01-06", "Lunch", "-12.00", "Checking"),
        ];
        let pipeline = pipeline(&store);
        pipeline.run(ImportBatch::from_rows(rows.clone()).unwrap()).await.unwrap();

        let (report, merge) = pipeline.run(ImportBatch::from_rows(rows).unwrap()).await.unwrap();

        assert_eq!(report.imported, 0);
        assert_eq!(report.skipped_duplicates, 2);
        assert_eq!(report.new_accounts, 0);
        assert_eq!(report.commit_id, None);
        assert_eq!(merge, MergeOutcome::Empty);
        assert_eq!(store.reader().count(EntityKind::Transaction).await.unwrap(), 2);
    }
}
