//! Client-side ordering of cached object keys.

use std::cmp::Ordering;
use std::sync::Arc;

use lamina_core::{compare_values, ObjectSnapshot, OrderBy, SortDirection};

use crate::batch::BatchContext;
use crate::cache_key::CacheKey;
use crate::canonical::Canonical;

/// Reorders member keys of a collection.
pub trait SortingStrategy: Send + Sync {
    fn sort_cache_keys(&self, keys: Vec<CacheKey>, batch: &BatchContext<'_>) -> Vec<CacheKey>;
}

/// Leaves keys in the order given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSortingStrategy;

impl SortingStrategy for NoOpSortingStrategy {
    fn sort_cache_keys(&self, keys: Vec<CacheKey>, _batch: &BatchContext<'_>) -> Vec<CacheKey> {
        keys
    }
}

/// Orders keys by the objects' properties as seen from the batch's layer.
///
/// Missing or null values sort last in either direction. Keys that compare
/// equal on every term keep their relative input order.
#[derive(Debug, Clone)]
pub struct OrderBySortingStrategy {
    order_by: Canonical<OrderBy>,
}

impl OrderBySortingStrategy {
    pub fn new(order_by: Canonical<OrderBy>) -> Self {
        Self { order_by }
    }

    /// Compare two snapshots under this ordering.
    pub fn compare(&self, a: Option<&ObjectSnapshot>, b: Option<&ObjectSnapshot>) -> Ordering {
        for term in &self.order_by.terms {
            let left = a.and_then(|o| o.property(&term.property));
            let right = b.and_then(|o| o.property(&term.property));
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(l), Some(r)) => {
                    let natural = compare_values(l, r).unwrap_or(Ordering::Equal);
                    match term.direction {
                        SortDirection::Asc => natural,
                        SortDirection::Desc => natural.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl SortingStrategy for OrderBySortingStrategy {
    fn sort_cache_keys(&self, keys: Vec<CacheKey>, batch: &BatchContext<'_>) -> Vec<CacheKey> {
        let mut resolved: Vec<(CacheKey, Option<Arc<ObjectSnapshot>>)> = keys
            .into_iter()
            .map(|k| {
                let object = batch.read_layer_object(&k);
                (k, object)
            })
            .collect();
        // sort_by is stable
        resolved.sort_by(|(_, a), (_, b)| self.compare(a.as_deref(), b.as_deref()));
        resolved.into_iter().map(|(k, _)| k).collect()
    }
}

/// Pick the strategy for a canonical ordering.
pub fn strategy_for(order_by: &Canonical<OrderBy>) -> Box<dyn SortingStrategy> {
    if order_by.is_empty() {
        Box::new(NoOpSortingStrategy)
    } else {
        Box::new(OrderBySortingStrategy::new(order_by.clone()))
    }
}
