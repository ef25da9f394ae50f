//! Subscriber-facing payloads, observers and subscriptions.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lamina_core::{
    AggregationResult, CacheError, FetchError, ObjectSnapshot, Status, Timestamp,
};

use crate::cache_key::{CacheKey, KeyKind};
use crate::layer::{Entry, Layers};
use crate::store::StoreInner;

// ============================================================================
// PAYLOADS
// ============================================================================

/// State of one object as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPayload {
    pub status: Status,
    /// `None` before the first load, after an error, and for deleted objects.
    pub object: Option<Arc<ObjectSnapshot>>,
    pub error: Option<FetchError>,
    /// True while an optimistic layer overrides the confirmed value.
    pub is_optimistic: bool,
    pub last_updated: Option<Timestamp>,
}

/// State of a list or link query as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPayload {
    pub status: Status,
    /// Resolved member objects in order. Deleted members are omitted.
    pub objects: Vec<Arc<ObjectSnapshot>>,
    pub has_more: bool,
    pub total_count: Option<u64>,
    pub error: Option<FetchError>,
    pub is_optimistic: bool,
    pub last_updated: Option<Timestamp>,
}

/// State of an aggregation query as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPayload {
    pub status: Status,
    pub result: Option<Arc<AggregationResult>>,
    pub error: Option<FetchError>,
    pub is_optimistic: bool,
    pub last_updated: Option<Timestamp>,
}

/// Payload delivered by a subject, shaped by the key's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(ObjectPayload),
    List(ListPayload),
    Aggregation(AggregationPayload),
}

impl Payload {
    pub fn status(&self) -> Status {
        match self {
            Self::Object(p) => p.status,
            Self::List(p) => p.status,
            Self::Aggregation(p) => p.status,
        }
    }

    /// Build the payload `key` currently resolves to.
    pub(crate) fn resolve(key: &CacheKey, layers: &Layers) -> Self {
        let entry = layers.get(key);
        let status = entry.map(Entry::status).unwrap_or_default();
        let error = entry.and_then(Entry::error).cloned();
        let is_optimistic = layers.is_optimistic(key);
        let last_updated = entry.map(|e| e.last_updated);

        match key.kind() {
            KeyKind::Object => Self::Object(ObjectPayload {
                status,
                object: entry.and_then(Entry::object).cloned(),
                error,
                is_optimistic,
                last_updated,
            }),
            KeyKind::List | KeyKind::InterfaceList | KeyKind::SpecificLink => {
                let collection = entry.and_then(Entry::collection);
                let objects = collection
                    .map(|c| {
                        c.members
                            .iter()
                            .filter_map(|m| layers.get(m).and_then(Entry::object).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                Self::List(ListPayload {
                    status,
                    objects,
                    has_more: collection.map(|c| c.has_more()).unwrap_or(false),
                    total_count: collection.and_then(|c| c.total_count),
                    error,
                    is_optimistic,
                    last_updated,
                })
            }
            KeyKind::Aggregation => Self::Aggregation(AggregationPayload {
                status,
                result: entry
                    .and_then(Entry::value)
                    .and_then(|v| v.as_aggregation())
                    .cloned(),
                error,
                is_optimistic,
                last_updated,
            }),
        }
    }
}

impl TryFrom<Payload> for ObjectPayload {
    type Error = Payload;

    fn try_from(payload: Payload) -> Result<Self, Payload> {
        match payload {
            Payload::Object(p) => Ok(p),
            other => Err(other),
        }
    }
}

impl TryFrom<Payload> for ListPayload {
    type Error = Payload;

    fn try_from(payload: Payload) -> Result<Self, Payload> {
        match payload {
            Payload::List(p) => Ok(p),
            other => Err(other),
        }
    }
}

impl TryFrom<Payload> for AggregationPayload {
    type Error = Payload;

    fn try_from(payload: Payload) -> Result<Self, Payload> {
        match payload {
            Payload::Aggregation(p) => Ok(p),
            other => Err(other),
        }
    }
}

// ============================================================================
// OBSERVERS
// ============================================================================

/// Receives values from a subject.
pub trait Observer<T>: Send + Sync {
    fn next(&self, value: T);

    fn error(&self, _error: &CacheError) {}

    fn complete(&self) {}
}

impl<T, F> Observer<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn next(&self, value: T) {
        self(value)
    }
}

/// Narrows a `Payload` observer down to one payload shape.
pub(crate) struct Typed<T, O> {
    observer: O,
    _payload: PhantomData<fn(T)>,
}

impl<T, O> Typed<T, O> {
    pub(crate) fn new(observer: O) -> Self {
        Self {
            observer,
            _payload: PhantomData,
        }
    }
}

impl<T, O> Observer<Payload> for Typed<T, O>
where
    T: TryFrom<Payload>,
    O: Observer<T>,
{
    fn next(&self, value: Payload) {
        if let Ok(typed) = T::try_from(value) {
            self.observer.next(typed);
        }
    }

    fn error(&self, error: &CacheError) {
        self.observer.error(error);
    }

    fn complete(&self) {
        self.observer.complete();
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Handle for one active observer.
///
/// Dropping the handle unsubscribes. Releasing the last subscription on a
/// key starts its keep-alive period.
pub struct Subscription {
    store: Weak<StoreInner>,
    key: CacheKey,
    observer_id: u64,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(store: Weak<StoreInner>, key: CacheKey, observer_id: u64) -> Self {
        Self {
            store,
            key,
            observer_id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop receiving values. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, self.observer_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("observer_id", &self.observer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
