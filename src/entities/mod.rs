// Entity Models - the persistable record types of the ledger
//
// Arena + index: every entity lives in a flat table keyed by its identity key.
// Cross-entity relationships are soft references (key + display name) that the
// reference resolver turns into live links; nothing owns anything else.

pub mod account;
pub mod aggregate;
pub mod category;
pub mod link;
pub mod recurring;
pub mod transaction;

pub use account::{Account, AccountType};
pub use aggregate::{Aggregate, AggregateKey, WILDCARD};
pub use category::{Category, CategoryKind};
pub use link::Link;
pub use recurring::{generate_occurrences, Frequency, GeneratedBatch, RecurringOccurrence, RecurringSeries};
pub use transaction::{Transaction, TransactionKind};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Transaction,
    Category,
    RecurringSeries,
    RecurringOccurrence,
    Aggregate,
    Link,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Account,
        EntityKind::Transaction,
        EntityKind::Category,
        EntityKind::RecurringSeries,
        EntityKind::RecurringOccurrence,
        EntityKind::Aggregate,
        EntityKind::Link,
    ];

    /// Backing table in the durable store
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Account => "accounts",
            EntityKind::Transaction => "transactions",
            EntityKind::Category => "categories",
            EntityKind::RecurringSeries => "recurring_series",
            EntityKind::RecurringOccurrence => "recurring_occurrences",
            EntityKind::Aggregate => "aggregates",
            EntityKind::Link => "links",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Transaction => "transaction",
            EntityKind::Category => "category",
            EntityKind::RecurringSeries => "recurring_series",
            EntityKind::RecurringOccurrence => "recurring_occurrence",
            EntityKind::Aggregate => "aggregate",
            EntityKind::Link => "link",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s || kind.table() == s)
            .ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

// ============================================================================
// SOFT REFERENCES
// ============================================================================

/// Identity key plus a denormalized display value.
///
/// Stored inside the referencing payload, so it survives deletion of the target
/// regardless of whether a live link still resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl SoftRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        SoftRef {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A named, typed pointer from one entity to another by identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub name: &'static str,
    pub target: EntityKind,
    pub key: String,
}

impl Reference {
    pub fn new(name: &'static str, target: EntityKind, key: impl Into<String>) -> Self {
        Reference {
            name,
            target,
            key: key.into(),
        }
    }
}

/// Columns computed by the save lifecycle rather than supplied by producers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedColumns {
    /// Sortable bucket key (e.g. "2024-01" for a January transaction)
    pub sort_key: Option<String>,

    /// Duplicate-detection fingerprint (transactions only)
    pub fingerprint: Option<String>,
}

// ============================================================================
// DOMAIN ENTITY
// ============================================================================

/// Any persistable record type.
///
/// The payload is the serde JSON object of the entity; field-by-field diffing
/// and per-field writes operate on its top-level keys.
pub trait DomainEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Stable caller-assigned identity key, unique per kind
    fn id(&self) -> &str;

    /// Outgoing references that should be wired as live links
    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Derived columns. Called by the normal save path; the bulk path calls it
    /// explicitly before submission.
    fn derived(&self) -> DerivedColumns {
        DerivedColumns::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tables_are_unique() {
        let mut tables: Vec<&str> = EntityKind::ALL.iter().map(|k| k.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
    }

    #[test]
    fn test_kind_from_str_accepts_name_and_table() {
        assert_eq!("account".parse::<EntityKind>(), Ok(EntityKind::Account));
        assert_eq!("recurring_series".parse::<EntityKind>(), Ok(EntityKind::RecurringSeries));
        assert_eq!("transactions".parse::<EntityKind>(), Ok(EntityKind::Transaction));
        assert!("budget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_soft_ref_name_defaults_when_absent() {
        let soft: SoftRef = serde_json::from_str(r#"{"id": "5"}"#).unwrap();
        assert_eq!(soft.id, "5");
        assert_eq!(soft.name, "");
    }
}
