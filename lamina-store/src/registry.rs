//! Dependents index.
//!
//! Tracks which collection entries (lists and links) contain which objects,
//! so a change to an object can re-emit every collection showing it, and
//! which list keys exist per object type, so freshly written objects can be
//! routed into matching lists.

use std::collections::{HashMap, HashSet};

use crate::cache_key::{CacheKey, KeyParams};

/// Bidirectional object <-> collection mapping, plus lists per type.
#[derive(Debug, Default)]
pub struct DependentsIndex {
    /// Maps objects to every collection that lists them
    object_to_collections: HashMap<CacheKey, HashSet<CacheKey>>,
    /// Maps collections to their members
    collection_to_objects: HashMap<CacheKey, HashSet<CacheKey>>,
    /// Unpivoted list keys per object type
    lists_by_type: HashMap<String, HashSet<CacheKey>>,
}

impl DependentsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the member set of a collection.
    ///
    /// Returns the objects that are no longer listed by any collection.
    pub fn set_members(&mut self, collection: &CacheKey, members: HashSet<CacheKey>) -> Vec<CacheKey> {
        let released = self.unlink(collection);
        for member in &members {
            self.object_to_collections
                .entry(member.clone())
                .or_default()
                .insert(collection.clone());
        }
        self.collection_to_objects.insert(collection.clone(), members);

        if let KeyParams::List {
            object_type,
            pivot: None,
            ..
        } = collection.params()
        {
            self.lists_by_type
                .entry(object_type.clone())
                .or_default()
                .insert(collection.clone());
        }

        released
            .into_iter()
            .filter(|o| !self.object_to_collections.contains_key(o))
            .collect()
    }

    /// Collections that currently list `object`.
    pub fn collections_containing(&self, object: &CacheKey) -> impl Iterator<Item = &CacheKey> {
        self.object_to_collections.get(object).into_iter().flatten()
    }

    /// Whether any collection lists `object`.
    pub fn is_listed(&self, object: &CacheKey) -> bool {
        self.object_to_collections.contains_key(object)
    }

    /// Unpivoted list keys over `object_type`.
    pub fn lists_of_type(&self, object_type: &str) -> Vec<CacheKey> {
        self.lists_by_type
            .get(object_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a collection entirely.
    ///
    /// Returns the objects that are no longer listed by any collection.
    pub fn remove_collection(&mut self, collection: &CacheKey) -> Vec<CacheKey> {
        let released = self.unlink(collection);
        if let Some(lists) = self.lists_by_type.get_mut(collection.object_type()) {
            lists.remove(collection);
            if lists.is_empty() {
                self.lists_by_type.remove(collection.object_type());
            }
        }
        released
            .into_iter()
            .filter(|o| !self.object_to_collections.contains_key(o))
            .collect()
    }

    fn unlink(&mut self, collection: &CacheKey) -> HashSet<CacheKey> {
        let previous = self.collection_to_objects.remove(collection).unwrap_or_default();
        for object in &previous {
            if let Some(collections) = self.object_to_collections.get_mut(object) {
                collections.remove(collection);
                if collections.is_empty() {
                    self.object_to_collections.remove(object);
                }
            }
        }
        previous
    }

    /// Number of tracked collections.
    pub fn collection_count(&self) -> usize {
        self.collection_to_objects.len()
    }
}
