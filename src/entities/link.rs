// 🔗 Link records - generic many-to-many relationships between entities
// (e.g. a transaction tagged into a category split, a transfer pair)

use super::{DomainEntity, EntityKind, Reference};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub source_kind: EntityKind,
    pub source_id: String,
    pub target_kind: EntityKind,
    pub target_id: String,
    #[serde(default)]
    pub label: String,
}

impl Link {
    pub fn between(
        source_kind: EntityKind,
        source_id: impl Into<String>,
        target_kind: EntityKind,
        target_id: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        let label = label.into();
        Link {
            id: format!("{}:{}>{}:{}#{}", source_kind, source_id, target_kind, target_id, label),
            source_kind,
            source_id,
            target_kind,
            target_id,
            label,
        }
    }
}

impl DomainEntity for Link {
    const KIND: EntityKind = EntityKind::Link;

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new("source", self.source_kind, self.source_id.clone()),
            Reference::new("target", self.target_kind, self.target_id.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_identity_is_stable() {
        let a = Link::between(EntityKind::Transaction, "t1", EntityKind::Transaction, "t2", "transfer");
        let b = Link::between(EntityKind::Transaction, "t1", EntityKind::Transaction, "t2", "transfer");
        assert_eq!(a.id, b.id);
        assert_eq!(a.references()[1].target, EntityKind::Transaction);
    }
}
