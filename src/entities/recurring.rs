// 🔁 Recurring Series & Occurrences
//
// A series produces one occurrence (and one transaction) per due date. The
// series carries a "last generated" marker so regeneration only covers new
// dates; occurrence and transaction ids are derived from (series, date) so
// regenerating the same range yields the same identities.

use super::{DerivedColumns, DomainEntity, EntityKind, Reference, SoftRef, Transaction, TransactionKind};
use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

// ============================================================================
// FREQUENCY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    /// The n-th due date counted from `start` (n = 0 is `start`).
    ///
    /// Month-based steps are computed from the start date, not chained, so a
    /// series starting on the 31st returns to the 31st after a short month.
    pub fn nth(&self, start: NaiveDate, n: u32) -> Option<NaiveDate> {
        match self {
            Frequency::Daily => start.checked_add_days(Days::new(n as u64)),
            Frequency::Weekly => start.checked_add_days(Days::new(7 * n as u64)),
            Frequency::Biweekly => start.checked_add_days(Days::new(14 * n as u64)),
            Frequency::Monthly => start.checked_add_months(Months::new(n)),
            Frequency::Quarterly => start.checked_add_months(Months::new(3 * n)),
            Frequency::Yearly => start.checked_add_months(Months::new(12 * n)),
        }
    }
}

// ============================================================================
// RECURRING SERIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub kind: TransactionKind,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub account: SoftRef,

    #[serde(default)]
    pub category: Option<SoftRef>,

    /// Last due date for which an occurrence was generated
    #[serde(default)]
    pub last_generated: Option<NaiveDate>,

    /// Added after the first schema revision; older series stay active
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RecurringSeries {
    /// Due dates after `last_generated` up to and including `until`
    pub fn due_dates(&self, until: NaiveDate) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        if !self.is_active {
            return dates;
        }

        let mut n = 0;
        while let Some(date) = self.frequency.nth(self.start_date, n) {
            if date > until {
                break;
            }
            if self.last_generated.map_or(true, |last| date > last) {
                dates.push(date);
            }
            n += 1;
        }
        dates
    }

    pub fn occurrence_id(&self, date: NaiveDate) -> String {
        format!("{}:{}", self.id, date)
    }

    pub fn transaction_id(&self, date: NaiveDate) -> String {
        format!("{}:tx:{}", self.id, date)
    }
}

impl DomainEntity for RecurringSeries {
    const KIND: EntityKind = EntityKind::RecurringSeries;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = vec![Reference::new("account", EntityKind::Account, self.account.id.clone())];
        if let Some(category) = &self.category {
            refs.push(Reference::new("category", EntityKind::Category, category.id.clone()));
        }
        refs
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(self.start_date.format("%Y-%m-%d").to_string()),
            fingerprint: None,
        }
    }
}

// ============================================================================
// RECURRING OCCURRENCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringOccurrence {
    pub id: String,
    pub series_id: String,
    pub due_date: NaiveDate,

    /// Transaction generated for this occurrence, if any
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl DomainEntity for RecurringOccurrence {
    const KIND: EntityKind = EntityKind::RecurringOccurrence;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = vec![Reference::new("series", EntityKind::RecurringSeries, self.series_id.clone())];
        if let Some(tx) = &self.transaction_id {
            refs.push(Reference::new("transaction", EntityKind::Transaction, tx.clone()));
        }
        refs
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(self.due_date.format("%Y-%m-%d").to_string()),
            fingerprint: None,
        }
    }
}

// ============================================================================
// GENERATION
// ============================================================================

/// Output of one generator pass for a single series
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub transactions: Vec<Transaction>,
    pub occurrences: Vec<RecurringOccurrence>,
    /// The series with its `last_generated` marker advanced
    pub series: RecurringSeries,
}

impl GeneratedBatch {
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }
}

/// Generate everything due for `series` up to `until`.
pub fn generate_occurrences(series: &RecurringSeries, until: NaiveDate) -> GeneratedBatch {
    let dates = series.due_dates(until);
    let mut transactions = Vec::with_capacity(dates.len());
    let mut occurrences = Vec::with_capacity(dates.len());

    for date in &dates {
        let mut tx = Transaction::new(
            series.transaction_id(*date),
            *date,
            series.amount,
            series.name.clone(),
            series.account.clone(),
        );
        tx.kind = series.kind;
        tx.category = series.category.clone();
        tx.series_id = Some(series.id.clone());

        occurrences.push(RecurringOccurrence {
            id: series.occurrence_id(*date),
            series_id: series.id.clone(),
            due_date: *date,
            transaction_id: Some(tx.id.clone()),
        });
        transactions.push(tx);
    }

    let mut updated = series.clone();
    if let Some(last) = dates.last() {
        updated.last_generated = Some(*last);
    }

    GeneratedBatch {
        transactions,
        occurrences,
        series: updated,
    }
}
