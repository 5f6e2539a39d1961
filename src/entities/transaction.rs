// 💸 Transaction Entity
//
// Every reference a transaction holds (account, transfer target, category,
// recurring series) is a soft reference: the key and display name stay in the
// payload even after the referenced entity is deleted.

use super::{DerivedColumns, DomainEntity, EntityKind, Reference, SoftRef};
use crate::deduplication::Fingerprint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Expense,
    Income,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Expense => "Expense",
            TransactionKind::Income => "Income",
            TransactionKind::Transfer => "Transfer",
        }
    }

    /// Classify by sign when the source carries no explicit kind
    pub fn from_amount(amount: f64) -> Self {
        if amount < 0.0 {
            TransactionKind::Expense
        } else {
            TransactionKind::Income
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub description: String,
    pub kind: TransactionKind,

    /// Owning account
    pub account: SoftRef,

    /// Receiving account for transfers
    #[serde(default)]
    pub target_account: Option<SoftRef>,

    #[serde(default)]
    pub category: Option<SoftRef>,

    /// Recurring series this transaction was generated from
    #[serde(default)]
    pub series_id: Option<String>,

    #[serde(default)]
    pub note: String,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        date: NaiveDate,
        amount: f64,
        description: impl Into<String>,
        account: SoftRef,
    ) -> Self {
        Transaction {
            id: id.into(),
            date,
            amount,
            description: description.into(),
            kind: TransactionKind::from_amount(amount),
            account,
            target_account: None,
            category: None,
            series_id: None,
            note: String::new(),
        }
    }

    pub fn with_category(mut self, category: SoftRef) -> Self {
        self.category = Some(category);
        self
    }

    pub fn transfer_to(mut self, target: SoftRef) -> Self {
        self.kind = TransactionKind::Transfer;
        self.target_account = Some(target);
        self
    }

    /// Sortable month bucket, e.g. "2024-01"
    pub fn date_bucket(&self) -> String {
        self.date.format("%Y-%m").to_string()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

impl DomainEntity for Transaction {
    const KIND: EntityKind = EntityKind::Transaction;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = vec![Reference::new("account", EntityKind::Account, self.account.id.clone())];
        if let Some(target) = &self.target_account {
            refs.push(Reference::new("target_account", EntityKind::Account, target.id.clone()));
        }
        if let Some(category) = &self.category {
            refs.push(Reference::new("category", EntityKind::Category, category.id.clone()));
        }
        if let Some(series) = &self.series_id {
            refs.push(Reference::new("series", EntityKind::RecurringSeries, series.clone()));
        }
        refs
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(self.date_bucket()),
            fingerprint: Some(self.fingerprint().into_string()),
        }
    }
}
