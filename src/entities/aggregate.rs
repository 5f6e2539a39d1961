// 📊 Rollup Aggregates
//
// Supplied by the recompute pipeline as full or partial target sets and
// reconciled like any other entity. Keyed by (category, subcategory, year,
// month, day); 0 is the "all" sentinel at every level.

use super::{DerivedColumns, DomainEntity, EntityKind, Reference};
use serde::{Deserialize, Serialize};

/// Wildcard value for category/subcategory keys
pub const WILDCARD: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub category: String,
    pub subcategory: String,
    pub year: u32,
    pub month: u32,
    /// Added with daily rollups; absent means the monthly bucket
    #[serde(default)]
    pub day: u32,
}

impl AggregateKey {
    pub fn monthly(category: impl Into<String>, year: u32, month: u32) -> Self {
        AggregateKey {
            category: category.into(),
            subcategory: WILDCARD.to_string(),
            year,
            month,
            day: 0,
        }
    }

    pub fn with_subcategory(mut self, subcategory: impl Into<String>) -> Self {
        self.subcategory = subcategory.into();
        self
    }

    pub fn with_day(mut self, day: u32) -> Self {
        self.day = day;
        self
    }

    /// Identity key derived from the key tuple
    pub fn identity(&self) -> String {
        format!(
            "agg:{}:{}:{}:{}:{}",
            self.category, self.subcategory, self.year, self.month, self.day
        )
    }

    pub fn is_all_categories(&self) -> bool {
        self.category == WILDCARD
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: String,

    #[serde(flatten)]
    pub key: AggregateKey,

    pub total: f64,

    #[serde(default)]
    pub count: u32,
}

impl Aggregate {
    pub fn new(key: AggregateKey, total: f64, count: u32) -> Self {
        Aggregate {
            id: key.identity(),
            key,
            total,
            count,
        }
    }
}

impl DomainEntity for Aggregate {
    const KIND: EntityKind = EntityKind::Aggregate;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = Vec::new();
        if self.key.category != WILDCARD {
            refs.push(Reference::new("category", EntityKind::Category, self.key.category.clone()));
        }
        if self.key.subcategory != WILDCARD {
            refs.push(Reference::new("subcategory", EntityKind::Category, self.key.subcategory.clone()));
        }
        refs
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(format!(
                "{:04}-{:02}-{:02}",
                self.key.year, self.key.month, self.key.day
            )),
            fingerprint: None,
        }
    }
}
