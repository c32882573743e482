//! Keyed diff between persisted rows and declared rows.

use std::collections::BTreeMap;

use crate::rbac::models::{Record, RecordId};

/// What it takes to turn the persisted rows into the declared ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<K, D> {
    /// Declared but not persisted.
    pub create: Vec<(K, D)>,
    /// Persisted under the same key with different data.
    pub update: Vec<(K, RecordId, D)>,
    /// Persisted but no longer declared.
    pub delete: Vec<(K, RecordId)>,
    /// Persisted and identical.
    pub unchanged: Vec<(K, RecordId)>,
}

impl<K, D> Diff<K, D> {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff `existing` rows against `desired`, matching on `key`.
///
/// Row identity is never rewritten: a key present on both sides keeps its id.
pub fn diff<K, D, F>(existing: Vec<Record<D>>, mut desired: BTreeMap<K, D>, key: F) -> Diff<K, D>
where
    K: Ord,
    D: PartialEq,
    F: Fn(&D) -> K,
{
    let mut plan = Diff {
        create: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
        unchanged: Vec::new(),
    };

    for row in existing {
        let row_key = key(&row.data);
        match desired.remove(&row_key) {
            Some(data) if data == row.data => plan.unchanged.push((row_key, row.id)),
            Some(data) => plan.update.push((row_key, row.id, data)),
            None => plan.delete.push((row_key, row.id)),
        }
    }
    plan.create.extend(desired);

    plan
}
