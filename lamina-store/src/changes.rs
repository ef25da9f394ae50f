//! Per-batch change sets.

use std::collections::HashMap;

use crate::cache_key::CacheKey;
use crate::layer::Entry;

/// What one committed batch changed.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    /// Every key whose visible value changed, with the value it now resolves
    /// to (`None` when no layer holds it any more). Collections whose
    /// members changed are included.
    pub modified: HashMap<CacheKey, Option<Entry>>,
    /// Object keys written by the batch, in first-write order.
    pub written_objects: Vec<CacheKey>,
    /// Object keys the batch tombstoned.
    pub deleted_objects: Vec<CacheKey>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modified.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.modified.contains_key(key)
    }

    /// The entry `key` resolves to after the batch, if it changed.
    pub fn get(&self, key: &CacheKey) -> Option<&Entry> {
        self.modified.get(key).and_then(Option::as_ref)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.modified.keys()
    }
}
