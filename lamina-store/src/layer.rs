//! Layered entry storage.
//!
//! One base layer holds confirmed data. Optimistic layers stack on top in
//! creation order; reads resolve top-down and the first layer holding the
//! key wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use lamina_core::{
    AggregationResult, CacheResult, FetchError, InvariantError, ObjectSnapshot, OptimisticId,
    Status, Timestamp,
};

use crate::cache_key::CacheKey;

// ============================================================================
// ENTRIES
// ============================================================================

/// Members of a list or link result, plus paging state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionData {
    /// Member object keys in display order.
    pub members: Vec<CacheKey>,
    /// Total size reported by the server, if it reported one.
    pub total_count: Option<u64>,
    /// Token for the next page; `None` once everything is loaded.
    pub next_page_token: Option<String>,
}

impl CollectionData {
    pub fn has_more(&self) -> bool {
        self.next_page_token.is_some()
    }
}

/// Payload stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue {
    Object(Arc<ObjectSnapshot>),
    /// A deleted object. Shadows lower layers and is hidden from lists.
    Tombstone,
    Collection(Arc<CollectionData>),
    Aggregation(Arc<AggregationResult>),
}

impl EntryValue {
    pub fn as_object(&self) -> Option<&Arc<ObjectSnapshot>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<CollectionData>> {
        match self {
            Self::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_aggregation(&self) -> Option<&Arc<AggregationResult>> {
        match self {
            Self::Aggregation(a) => Some(a),
            _ => None,
        }
    }
}

/// Lifecycle state of one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    /// A fetch is in flight; the previous value, if any, is kept visible.
    Loading(Option<EntryValue>),
    Loaded(EntryValue),
    /// The last fetch failed. Any previous value is dropped.
    Errored(FetchError),
}

/// One stored entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub state: EntryState,
    pub last_updated: Timestamp,
}

impl Entry {
    pub fn new(state: EntryState) -> Self {
        Self {
            state,
            last_updated: Utc::now(),
        }
    }

    pub fn loaded(value: EntryValue) -> Self {
        Self::new(EntryState::Loaded(value))
    }

    pub fn status(&self) -> Status {
        match self.state {
            EntryState::Loading(_) => Status::Loading,
            EntryState::Loaded(_) => Status::Loaded,
            EntryState::Errored(_) => Status::Error,
        }
    }

    pub fn value(&self) -> Option<&EntryValue> {
        match &self.state {
            EntryState::Loading(v) => v.as_ref(),
            EntryState::Loaded(v) => Some(v),
            EntryState::Errored(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.state {
            EntryState::Errored(e) => Some(e),
            _ => None,
        }
    }

    /// Object snapshot, or `None` for tombstones and non-object entries.
    pub fn object(&self) -> Option<&Arc<ObjectSnapshot>> {
        self.value().and_then(EntryValue::as_object)
    }

    pub fn collection(&self) -> Option<&Arc<CollectionData>> {
        self.value().and_then(EntryValue::as_collection)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value(), Some(EntryValue::Tombstone))
    }

    /// Equal state, ignoring the write timestamp.
    pub fn same_content(&self, other: &Entry) -> bool {
        self.state == other.state
    }
}

fn same_resolved(a: Option<&Entry>, b: Option<&Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_content(b),
        _ => false,
    }
}

// ============================================================================
// LAYERS
// ============================================================================

/// Which layer a batch writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerTarget {
    Base,
    Optimistic(OptimisticId),
}

#[derive(Debug)]
struct OptimisticLayer {
    id: OptimisticId,
    entries: HashMap<CacheKey, Entry>,
}

/// The base layer plus the stack of optimistic layers.
#[derive(Debug, Default)]
pub struct Layers {
    base: HashMap<CacheKey, Entry>,
    optimistic: Vec<OptimisticLayer>,
    retired: HashSet<OptimisticId>,
}

impl Layers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a key top-down across all layers.
    pub fn get(&self, key: &CacheKey) -> Option<&Entry> {
        self.optimistic
            .iter()
            .rev()
            .find_map(|layer| layer.entries.get(key))
            .or_else(|| self.base.get(key))
    }

    pub fn base_entry(&self, key: &CacheKey) -> Option<&Entry> {
        self.base.get(key)
    }

    /// Resolve a key as if `pending` had already been written to `target`.
    pub fn get_with_pending<'a>(
        &'a self,
        key: &CacheKey,
        target: LayerTarget,
        pending: Option<&'a Entry>,
    ) -> Option<&'a Entry> {
        let pending = match pending {
            Some(p) => p,
            None => return self.get(key),
        };
        match target {
            LayerTarget::Base => self
                .optimistic
                .iter()
                .rev()
                .find_map(|layer| layer.entries.get(key))
                .or(Some(pending)),
            LayerTarget::Optimistic(id) => {
                // A layer that doesn't exist yet is pushed on top.
                let position = self.position(id).unwrap_or(self.optimistic.len());
                self.optimistic[position..]
                    .iter()
                    .skip(1)
                    .rev()
                    .find_map(|layer| layer.entries.get(key))
                    .or(Some(pending))
            }
        }
    }

    /// The entry `key` has in exactly the `target` layer.
    pub fn entry_in(&self, target: LayerTarget, key: &CacheKey) -> Option<&Entry> {
        match target {
            LayerTarget::Base => self.base.get(key),
            LayerTarget::Optimistic(id) => self
                .position(id)
                .and_then(|p| self.optimistic[p].entries.get(key)),
        }
    }

    /// Resolve `key` through the layers underneath `target` only.
    ///
    /// Nothing lies beneath the base layer. An optimistic layer that does
    /// not exist yet sits on top of every current layer.
    pub fn get_beneath(&self, target: LayerTarget, key: &CacheKey) -> Option<&Entry> {
        match target {
            LayerTarget::Base => None,
            LayerTarget::Optimistic(id) => {
                let position = self.position(id).unwrap_or(self.optimistic.len());
                self.optimistic[..position]
                    .iter()
                    .rev()
                    .find_map(|layer| layer.entries.get(key))
                    .or_else(|| self.base.get(key))
            }
        }
    }

    fn position(&self, id: OptimisticId) -> Option<usize> {
        self.optimistic.iter().position(|l| l.id == id)
    }

    /// Fail if `target` names a layer that was already removed.
    pub fn check_target(&self, target: LayerTarget) -> CacheResult<()> {
        match target {
            LayerTarget::Optimistic(id) if self.retired.contains(&id) => {
                Err(InvariantError::LayerRetired { optimistic_id: id }.into())
            }
            _ => Ok(()),
        }
    }

    /// Write entries into `target`, creating the optimistic layer on first use.
    pub fn apply(
        &mut self,
        target: LayerTarget,
        writes: impl IntoIterator<Item = (CacheKey, Entry)>,
    ) -> CacheResult<()> {
        self.check_target(target)?;
        let entries = match target {
            LayerTarget::Base => &mut self.base,
            LayerTarget::Optimistic(id) => {
                let position = match self.position(id) {
                    Some(p) => p,
                    None => {
                        self.optimistic.push(OptimisticLayer {
                            id,
                            entries: HashMap::new(),
                        });
                        self.optimistic.len() - 1
                    }
                };
                &mut self.optimistic[position].entries
            }
        };
        entries.extend(writes);
        Ok(())
    }

    /// Remove an optimistic layer and return the keys it held.
    ///
    /// Removing a layer that never received a write still retires its id.
    pub fn remove_layer(&mut self, id: OptimisticId) -> Vec<CacheKey> {
        self.retired.insert(id);
        match self.position(id) {
            Some(p) => self.optimistic.remove(p).entries.into_keys().collect(),
            None => Vec::new(),
        }
    }

    /// Keys held by one optimistic layer.
    pub fn layer_keys(&self, id: OptimisticId) -> Vec<CacheKey> {
        self.position(id)
            .map(|p| self.optimistic[p].entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any optimistic layer holds the key.
    pub fn has_optimistic(&self, key: &CacheKey) -> bool {
        self.optimistic.iter().any(|l| l.entries.contains_key(key))
    }

    /// Whether the resolved value differs from the base layer's.
    pub fn is_optimistic(&self, key: &CacheKey) -> bool {
        self.has_optimistic(key) && !same_resolved(self.get(key), self.base.get(key))
    }

    /// Union of a collection's members across every layer.
    pub fn members_in_any_layer(&self, key: &CacheKey) -> HashSet<CacheKey> {
        self.optimistic
            .iter()
            .filter_map(|l| l.entries.get(key))
            .chain(self.base.get(key))
            .filter_map(Entry::collection)
            .flat_map(|c| c.members.iter().cloned())
            .collect()
    }

    /// Drop a key from the base layer.
    pub fn remove_base(&mut self, key: &CacheKey) -> Option<Entry> {
        self.base.remove(key)
    }

    /// Keys with an entry in the base layer.
    pub fn base_keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.base.keys()
    }

    pub fn optimistic_layer_count(&self) -> usize {
        self.optimistic.len()
    }

    pub fn base_len(&self) -> usize {
        self.base.len()
    }
}

/// Whether two resolutions of a key differ.
pub(crate) fn resolution_changed(before: Option<&Entry>, after: Option<&Entry>) -> bool {
    !same_resolved(before, after)
}
