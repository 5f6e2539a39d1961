// 🏷️ Category Entity
//
// Categories form a two-level tree (category → subcategory). The parent is a
// soft reference, so deleting a parent leaves subcategories readable.

use super::{DerivedColumns, DomainEntity, EntityKind, Reference, SoftRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryKind {
    Expense,
    Income,
}

impl Default for CategoryKind {
    fn default() -> Self {
        CategoryKind::Expense
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub kind: CategoryKind,

    /// Present for subcategories
    #[serde(default)]
    pub parent: Option<SoftRef>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Category {
            id: id.into(),
            name: name.into(),
            kind: CategoryKind::Expense,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: &Category) -> Self {
        self.parent = Some(SoftRef::new(parent.id.clone(), parent.name.clone()));
        self
    }

    pub fn is_subcategory(&self) -> bool {
        self.parent.is_some()
    }

    /// Identity key for a category discovered by name during CSV import
    pub fn key_for_name(name: &str) -> String {
        let slug: Vec<String> = name.split_whitespace().map(|w| w.to_lowercase()).collect();
        format!("category:{}", slug.join("-"))
    }
}

impl DomainEntity for Category {
    const KIND: EntityKind = EntityKind::Category;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        self.parent
            .iter()
            .map(|p| Reference::new("parent", EntityKind::Category, p.id.clone()))
            .collect()
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(self.name.to_lowercase()),
            fingerprint: None,
        }
    }
}
