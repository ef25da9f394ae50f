//! Batch contexts.
//!
//! A batch buffers its writes. Nothing reaches the layers until the batch
//! callback returns successfully, so a failing callback leaves no trace.
//! Reads inside the batch see the batch's own pending writes.

use std::collections::HashMap;
use std::sync::Arc;

use lamina_core::{CacheResult, ObjectSnapshot, OptimisticId, PrimaryKey};

use crate::cache_key::{CacheKey, KeyKind, KeyRegistry};
use crate::changes::Changes;
use crate::layer::{Entry, EntryState, EntryValue, LayerTarget, Layers};
use crate::registry::DependentsIndex;

/// Options for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Write into this optimistic layer instead of the base layer.
    pub optimistic_id: Option<OptimisticId>,
}

impl BatchOptions {
    pub fn base() -> Self {
        Self::default()
    }

    pub fn optimistic(id: OptimisticId) -> Self {
        Self {
            optimistic_id: Some(id),
        }
    }

    pub fn target(&self) -> LayerTarget {
        match self.optimistic_id {
            Some(id) => LayerTarget::Optimistic(id),
            None => LayerTarget::Base,
        }
    }
}

/// Result of a committed batch.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// Whatever the batch callback returned.
    pub value: R,
    pub changes: Changes,
}

/// Scoped read/write access to the store for one batch.
pub struct BatchContext<'a> {
    layers: &'a Layers,
    keys: &'a KeyRegistry,
    index: &'a DependentsIndex,
    target: LayerTarget,
    pending: HashMap<CacheKey, Entry>,
    order: Vec<CacheKey>,
}

impl<'a> BatchContext<'a> {
    pub(crate) fn new(
        layers: &'a Layers,
        keys: &'a KeyRegistry,
        index: &'a DependentsIndex,
        target: LayerTarget,
    ) -> Self {
        Self {
            layers,
            keys,
            index,
            target,
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn target(&self) -> LayerTarget {
        self.target
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.target, LayerTarget::Optimistic(_))
    }

    /// Resolve `key`, including this batch's pending writes.
    pub fn read(&self, key: &CacheKey) -> Option<&Entry> {
        self.layers
            .get_with_pending(key, self.target, self.pending.get(key))
    }

    /// Resolve an object key to its snapshot. Tombstones read as `None`.
    pub fn read_object(&self, key: &CacheKey) -> Option<Arc<ObjectSnapshot>> {
        self.read(key).and_then(Entry::object).cloned()
    }

    /// The entry `key` holds in this batch's own layer, pending writes
    /// included. Upper and lower layers are ignored.
    pub fn read_own(&self, key: &CacheKey) -> Option<&Entry> {
        self.pending
            .get(key)
            .or_else(|| self.layers.entry_in(self.target, key))
    }

    /// Resolve `key` as seen from this batch's layer: its own entry, or
    /// whatever lies beneath it. Layers stacked above are ignored, so a base
    /// batch only ever sees confirmed data.
    pub fn read_layer(&self, key: &CacheKey) -> Option<&Entry> {
        self.read_own(key)
            .or_else(|| self.layers.get_beneath(self.target, key))
    }

    /// Object snapshot as seen from this batch's layer.
    pub fn read_layer_object(&self, key: &CacheKey) -> Option<Arc<ObjectSnapshot>> {
        self.read_layer(key).and_then(Entry::object).cloned()
    }

    /// Queue a write. The last write to a key within a batch wins.
    pub fn write(&mut self, key: &CacheKey, state: EntryState) {
        if self.pending.insert(key.clone(), Entry::new(state)).is_none() {
            self.order.push(key.clone());
        }
    }

    /// Queue a loaded object snapshot under its interned key.
    ///
    /// Skipped when this batch's layer already holds an identical loaded
    /// snapshot. Other layers never count: a confirmed value equal to an
    /// optimistic one must still reach the base layer.
    pub fn write_object(&mut self, snapshot: ObjectSnapshot) -> CacheResult<CacheKey> {
        let key = self.keys.object(&snapshot.object_type, &snapshot.primary_key)?;
        let unchanged = matches!(
            self.read_own(&key).map(|e| &e.state),
            Some(EntryState::Loaded(EntryValue::Object(current))) if **current == snapshot
        );
        if !unchanged {
            self.write(&key, EntryState::Loaded(EntryValue::Object(Arc::new(snapshot))));
        }
        Ok(key)
    }

    /// Queue a tombstone for `key`.
    pub fn delete(&mut self, key: &CacheKey) {
        self.write(key, EntryState::Loaded(EntryValue::Tombstone));
    }

    /// Interned key for one object.
    pub fn object_key(&self, object_type: &str, primary_key: &PrimaryKey) -> CacheResult<CacheKey> {
        self.keys.object(object_type, primary_key)
    }

    pub(crate) fn has_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    pub(crate) fn lists_of_type(&self, object_type: &str) -> Vec<CacheKey> {
        self.index.lists_of_type(object_type)
    }

    /// Object keys written so far, in first-write order.
    pub(crate) fn written_objects(&self) -> Vec<CacheKey> {
        self.order
            .iter()
            .filter(|k| k.kind() == KeyKind::Object)
            .cloned()
            .collect()
    }

    pub(crate) fn into_writes(mut self) -> Vec<(CacheKey, Entry)> {
        let mut pending = std::mem::take(&mut self.pending);
        self.order
            .into_iter()
            .filter_map(|k| pending.remove(&k).map(|e| (k, e)))
            .collect()
    }
}
