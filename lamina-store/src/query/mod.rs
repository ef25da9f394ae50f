//! Query objects.
//!
//! One query object exists per cache key. It owns revalidation for that key
//! and decides whether an invalidation concerns it. Queries hold only a weak
//! reference back to the store that owns them.

pub mod aggregation;
pub mod interface_list;
pub mod invalidation;
pub mod links;
pub mod list;
pub mod object;
pub mod single_flight;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use lamina_core::{CacheError, CacheResult, InvariantError, Status};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::batch::BatchOptions;
use crate::cache_key::CacheKey;
use crate::layer::{Entry, EntryState};
use crate::store::StoreInner;

pub use aggregation::{AggregationOptions, AggregationQuery};
pub use interface_list::{InterfaceListOptions, InterfaceListQuery};
pub use links::{LinkOptions, LinkQuery};
pub use list::{AutoFetchMore, ListOptions, ListQuery};
pub use object::ObjectQuery;
pub use single_flight::{Flight, SingleFlight};

// ============================================================================
// SHARED QUERY STATE
// ============================================================================

/// Bookkeeping every query kind carries.
pub(crate) struct QueryCore {
    key: CacheKey,
    store: Weak<StoreInner>,
    flight: SingleFlight,
    last_fetch: Mutex<Option<Instant>>,
    invalidation_types: OnceCell<HashSet<String>>,
}

impl QueryCore {
    pub(crate) fn new(key: CacheKey, store: Weak<StoreInner>) -> Self {
        Self {
            key,
            store,
            flight: SingleFlight::new(),
            last_fetch: Mutex::new(None),
            invalidation_types: OnceCell::new(),
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn store(&self) -> CacheResult<Arc<StoreInner>> {
        self.store.upgrade().ok_or_else(|| {
            InvariantError::StoreDropped {
                operation: format!("query {}", self.key),
            }
            .into()
        })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.flight.is_running()
    }

    /// The revalidation currently running, if any.
    pub(crate) fn in_flight(&self) -> Option<Flight> {
        self.flight.current()
    }

    /// Run `fetch` single-flight unless a non-forced call falls inside the
    /// dedupe interval.
    pub(crate) async fn revalidate<F, Fut>(&self, force: bool, fetch: F) -> CacheResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        if let Some(in_flight) = self.flight.current() {
            return in_flight.await;
        }
        if !force && self.recently_fetched(&*self.store()?) {
            tracing::trace!(cache_key = %self.key, "Skipping revalidation inside dedupe interval");
            return Ok(());
        }
        let flight = self.flight.run(|| {
            self.mark_fetch_started();
            fetch()
        });
        flight.await
    }

    fn recently_fetched(&self, store: &StoreInner) -> bool {
        let interval = store.config.dedupe_interval;
        if interval.is_zero() {
            return false;
        }
        let last = *self
            .last_fetch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        matches!(last, Some(at) if at.elapsed() < interval)
    }

    fn mark_fetch_started(&self) {
        *self
            .last_fetch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// The types whose invalidation concerns this query, resolved once.
    pub(crate) async fn invalidation_types<F, Fut>(&self, resolve: F) -> CacheResult<&HashSet<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<HashSet<String>>>,
    {
        self.invalidation_types.get_or_try_init(resolve).await
    }

    /// Flip the base entry to loading, keeping whatever confirmed value it
    /// had.
    pub(crate) fn mark_loading(&self, store: &StoreInner) -> CacheResult<()> {
        let key = self.key.clone();
        store.batch(BatchOptions::base(), |batch| {
            let previous = batch.read_own(&key).cloned();
            if previous.as_ref().map(Entry::status) != Some(Status::Loading) {
                let value = previous.as_ref().and_then(Entry::value).cloned();
                batch.write(&key, EntryState::Loading(value));
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Record a fetch failure as the entry's state, then pass it to the
    /// observers' error channel.
    pub(crate) fn write_error(
        &self,
        store: &StoreInner,
        error: lamina_core::FetchError,
    ) -> CacheResult<()> {
        tracing::debug!(cache_key = %self.key, error = %error, "Fetch failed");
        let key = self.key.clone();
        let stored = error.clone();
        store.batch(BatchOptions::base(), move |batch| {
            batch.write(&key, EntryState::Errored(stored));
            Ok(())
        })?;
        store.report_error(&self.key, &CacheError::from(error));
        Ok(())
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Any query object.
#[derive(Clone)]
pub enum QueryHandle {
    Object(Arc<ObjectQuery>),
    List(Arc<ListQuery>),
    InterfaceList(Arc<InterfaceListQuery>),
    Link(Arc<LinkQuery>),
    Aggregation(Arc<AggregationQuery>),
}

impl QueryHandle {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Object(q) => q.key(),
            Self::List(q) => q.key(),
            Self::InterfaceList(q) => q.key(),
            Self::Link(q) => q.key(),
            Self::Aggregation(q) => q.key(),
        }
    }

    pub async fn revalidate(&self, force: bool) -> CacheResult<()> {
        match self {
            Self::Object(q) => q.revalidate(force).await,
            Self::List(q) => q.revalidate(force).await,
            Self::InterfaceList(q) => q.revalidate(force).await,
            Self::Link(q) => q.revalidate(force).await,
            Self::Aggregation(q) => q.revalidate(force).await,
        }
    }

    /// Revalidate if `object_type` is one this query depends on.
    ///
    /// Returns whether a revalidation ran.
    pub async fn invalidate_object_type(&self, object_type: &str) -> CacheResult<bool> {
        match self {
            Self::Object(q) => q.invalidate_object_type(object_type).await,
            Self::List(q) => q.invalidate_object_type(object_type).await,
            Self::InterfaceList(q) => q.invalidate_object_type(object_type).await,
            Self::Link(q) => q.invalidate_object_type(object_type).await,
            Self::Aggregation(q) => q.invalidate_object_type(object_type).await,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        match self {
            Self::Object(q) => q.core.is_busy(),
            Self::List(q) => q.is_busy(),
            Self::InterfaceList(q) => q.is_busy(),
            Self::Link(q) => q.is_busy(),
            Self::Aggregation(q) => q.core.is_busy(),
        }
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueryHandle({})", self.key())
    }
}
