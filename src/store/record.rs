// 📦 PersistedRecord - store-side counterpart of a domain entity
//
// A record is bound to the execution context that materialized it. It is
// deliberately !Send, so it cannot be returned out of a context's queue.

use crate::entities::{DomainEntity, EntityKind};
use crate::error::SyncResult;
use rusqlite::types::Type;
use rusqlite::Row;
use serde_json::{Map, Value};
use std::marker::PhantomData;

pub type FieldMap = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct PersistedRecord {
    pub row_id: i64,
    pub kind: EntityKind,
    pub id: String,
    pub fields: FieldMap,
    pub sort_key: Option<String>,
    pub fingerprint: Option<String>,
    _queue_bound: PhantomData<*const ()>,
}

impl PersistedRecord {
    /// Columns: row_id, id, payload, sort_key, fingerprint
    pub(crate) const COLUMNS: &'static str = "row_id, id, payload, sort_key, fingerprint";

    pub(crate) fn from_row(kind: EntityKind, row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get(2)?;
        let fields = match serde_json::from_str::<Value>(&payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => FieldMap::new(),
            Err(e) => return Err(rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))),
        };

        Ok(PersistedRecord {
            row_id: row.get(0)?,
            kind,
            id: row.get(1)?,
            fields,
            sort_key: row.get(3)?,
            fingerprint: row.get(4)?,
            _queue_bound: PhantomData,
        })
    }

    pub fn decode<T: DomainEntity>(&self) -> SyncResult<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Serialize an entity into its top-level field map
pub fn encode_fields<T: DomainEntity>(entity: &T) -> SyncResult<FieldMap> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "{} did not serialize to an object: {}",
            T::KIND,
            other
        ))
        .into()),
    }
}

/// Names of top-level fields whose values differ, sorted
pub fn changed_fields(old: &FieldMap, new: &FieldMap) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();

    for key in old.keys() {
        if !new.contains_key(key) {
            changed.push(key.clone());
        }
    }

    changed.sort();
    changed.dedup();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Account;

    #[test]
    fn test_changed_fields_detects_value_and_presence() {
        let old = encode_fields(&Account::new("1", "Checking")).unwrap();
        let new = encode_fields(&Account::new("1", "Checking-renamed").with_balance(10.0)).unwrap();
        assert_eq!(changed_fields(&old, &new), vec!["balance", "name"]);

        let mut legacy = old.clone();
        legacy.remove("is_archived");
        assert_eq!(changed_fields(&legacy, &old), vec!["is_archived"]);
        assert_eq!(changed_fields(&old, &legacy), vec!["is_archived"]);
    }

    #[test]
    fn test_identical_maps_have_no_changes() {
        let map = encode_fields(&Account::new("1", "Checking")).unwrap();
        assert!(changed_fields(&map, &map.clone()).is_empty());
    }

    #[test]
    fn test_stored_payload_round_trips_through_json_text() {
        let account = Account::new("1", "Checking").with_balance(100.0);
        let fields = encode_fields(&account).unwrap();
        let text = serde_json::to_string(&fields).unwrap();
        let back: FieldMap = serde_json::from_str(&text).unwrap();
        assert!(changed_fields(&fields, &back).is_empty());
    }
}
