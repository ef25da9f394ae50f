//! The store.
//!
//! Every mutation funnels through [`Store::batch`]. A batch runs its callback
//! under the state lock, commits the buffered writes, and only then, with
//! the lock released, notifies the subjects of every key whose resolved
//! value changed. Observers therefore never see a half-applied batch and
//! may call back into the store from `next`.
//!
//! Lock order is state, then key registry, then queries, then subjects.
//! Batch callbacks must not call back into the store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use lamina_core::{
    CacheError, CacheResult, InvariantError, ObjectSnapshot, OptimisticId, OrderBy, PrimaryKey,
    StoreConfig, WhereClause,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::batch::{BatchContext, BatchOptions, BatchOutcome};
use crate::bulk_loader::BulkLoader;
use crate::cache_key::{CacheKey, KeyKind, KeyParams, KeyRegistry};
use crate::canonical::{Canonical, OrderByCanonicalizer, WhereClauseCanonicalizer};
use crate::changes::Changes;
use crate::fetcher::{MetadataCache, MetadataProvider, ObjectFetcher};
use crate::layer::{resolution_changed, Entry, Layers};
use crate::observe::{
    AggregationPayload, ListPayload, ObjectPayload, Observer, Payload, Subscription, Typed,
};
use crate::query::list::sync_lists_with_writes;
use crate::query::{
    AggregationOptions, AggregationQuery, InterfaceListOptions, InterfaceListQuery, LinkOptions,
    LinkQuery, ListOptions, ListQuery, ObjectQuery, QueryHandle,
};
use crate::refcount::RefCounts;
use crate::registry::DependentsIndex;
use crate::subject::{Subject, SubjectRegistry};

// ============================================================================
// STATE
// ============================================================================

struct StoreState {
    layers: Layers,
    index: DependentsIndex,
    refcounts: RefCounts,
    /// Commit sequence number, bumped once per notifying commit.
    seq: u64,
}

impl StoreState {
    /// Work out what changed after `touched` keys were rewritten, given what
    /// each resolved to before.
    ///
    /// Collections among them get their dependents recomputed, and every
    /// collection listing a changed object is reported as changed too.
    fn settle(
        &mut self,
        touched: Vec<(CacheKey, Option<Entry>)>,
        report_all: bool,
        now: Instant,
    ) -> Changes {
        let mut changes = Changes::default();
        for (key, before) in touched {
            let after = self.layers.get(&key);
            if report_all || resolution_changed(before.as_ref(), after) {
                changes.modified.insert(key.clone(), after.cloned());
            }
            if key.is_collection() {
                let members = self.layers.members_in_any_layer(&key);
                for released in self.index.set_members(&key, members) {
                    self.refcounts.touch(&released, now);
                }
            }
        }

        let changed_objects: Vec<CacheKey> = changes
            .keys()
            .filter(|k| k.kind() == KeyKind::Object)
            .cloned()
            .collect();
        for object in changed_objects {
            for collection in self.index.collections_containing(&object) {
                if !changes.modified.contains_key(collection) {
                    changes
                        .modified
                        .insert(collection.clone(), self.layers.get(collection).cloned());
                }
            }
        }
        changes
    }

    /// Bump the sequence number and resolve a payload per subscribed key.
    fn payloads(&mut self, changes: &Changes, subjects: &SubjectRegistry) -> Notifications {
        if changes.is_empty() {
            return Notifications::default();
        }
        self.seq += 1;
        let deliveries = subjects
            .existing(changes.keys())
            .into_iter()
            .map(|subject| {
                let payload = Payload::resolve(subject.key(), &self.layers);
                (subject, payload)
            })
            .collect();
        Notifications {
            seq: self.seq,
            deliveries,
        }
    }
}

#[derive(Default)]
struct Notifications {
    seq: u64,
    deliveries: Vec<(Arc<Subject>, Payload)>,
}

impl Notifications {
    fn deliver(self) {
        for (subject, payload) in self.deliveries {
            subject.next(self.seq, payload);
        }
    }
}

/// Point-in-time counters describing a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub keys: usize,
    pub queries: usize,
    pub subjects: usize,
    pub optimistic_layers: usize,
    pub base_entries: usize,
    pub bulk_batches: u64,
}

// ============================================================================
// STORE INTERNALS
// ============================================================================

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    keys: KeyRegistry,
    wheres: WhereClauseCanonicalizer,
    orders: OrderByCanonicalizer,
    state: Mutex<StoreState>,
    subjects: SubjectRegistry,
    queries: Mutex<HashMap<CacheKey, QueryHandle>>,
    pub(crate) fetcher: Arc<dyn ObjectFetcher>,
    pub(crate) metadata: Arc<MetadataCache>,
    pub(crate) loader: BulkLoader,
    weak_self: Weak<StoreInner>,
}

impl StoreInner {
    fn lock_state(&self) -> CacheResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| InvariantError::LockPoisoned.into())
    }

    fn lock_queries(&self) -> CacheResult<MutexGuard<'_, HashMap<CacheKey, QueryHandle>>> {
        self.queries
            .lock()
            .map_err(|_| InvariantError::LockPoisoned.into())
    }

    pub(crate) fn batch<R, F>(&self, options: BatchOptions, f: F) -> CacheResult<BatchOutcome<R>>
    where
        F: FnOnce(&mut BatchContext<'_>) -> CacheResult<R>,
    {
        let target = options.target();
        let (value, changes, notifications, stale_lists) = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            state.layers.check_target(target)?;

            let mut batch = BatchContext::new(&state.layers, &self.keys, &state.index, target);
            let value = f(&mut batch)?;
            let stale_lists = sync_lists_with_writes(&mut batch);
            let writes = batch.into_writes();

            let mut touched = Vec::with_capacity(writes.len());
            let mut applied = Vec::with_capacity(writes.len());
            for (key, entry) in writes {
                let unchanged = matches!(
                    state.layers.entry_in(target, &key),
                    Some(current) if current.same_content(&entry)
                );
                if unchanged {
                    continue;
                }
                touched.push((key.clone(), state.layers.get(&key).cloned()));
                applied.push((key, entry));
            }
            if !applied.is_empty() {
                state.layers.apply(target, applied)?;
            }

            let written_objects: Vec<CacheKey> = touched
                .iter()
                .map(|(k, _)| k)
                .filter(|k| k.kind() == KeyKind::Object)
                .cloned()
                .collect();
            let mut changes = state.settle(touched, false, Instant::now());
            changes.written_objects = written_objects;
            changes.deleted_objects = changes
                .written_objects
                .iter()
                .filter(|k| state.layers.get(k).is_some_and(Entry::is_tombstone))
                .cloned()
                .collect();
            let notifications = state.payloads(&changes, &self.subjects);
            (value, changes, notifications, stale_lists)
        };

        tracing::trace!(
            target_layer = ?target,
            changed = changes.len(),
            seq = notifications.seq,
            "Committed batch"
        );
        notifications.deliver();
        for list in stale_lists {
            self.revalidate_in_background(&list, true);
        }
        Ok(BatchOutcome { value, changes })
    }

    pub(crate) fn read(&self, key: &CacheKey) -> CacheResult<Option<Entry>> {
        Ok(self.lock_state()?.layers.get(key).cloned())
    }

    pub(crate) fn remove_layer(&self, id: OptimisticId) -> CacheResult<Changes> {
        let (changes, notifications) = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            let touched: Vec<(CacheKey, Option<Entry>)> = state
                .layers
                .layer_keys(id)
                .into_iter()
                .map(|k| {
                    let before = state.layers.get(&k).cloned();
                    (k, before)
                })
                .collect();
            state.layers.remove_layer(id);
            let changes = state.settle(touched, true, Instant::now());
            let notifications = state.payloads(&changes, &self.subjects);
            (changes, notifications)
        };
        tracing::debug!(
            optimistic_id = %id,
            keys = changes.len(),
            "Removed optimistic layer"
        );
        notifications.deliver();
        Ok(changes)
    }

    pub(crate) fn optimistic_layer_keys(&self, id: OptimisticId) -> CacheResult<Vec<CacheKey>> {
        Ok(self.lock_state()?.layers.layer_keys(id))
    }

    /// Hand a failure to the error channel of every observer of `key`.
    pub(crate) fn report_error(&self, key: &CacheKey, error: &CacheError) {
        if let Some(subject) = self.subjects.get(key) {
            subject.error(error);
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn query_for<F>(&self, key: &CacheKey, create: F) -> CacheResult<QueryHandle>
    where
        F: FnOnce() -> CacheResult<QueryHandle>,
    {
        let mut queries = self.lock_queries()?;
        if let Some(existing) = queries.get(key) {
            return Ok(existing.clone());
        }
        let handle = create()?;
        queries.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    pub(crate) fn object_query(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> CacheResult<Arc<ObjectQuery>> {
        let key = self.keys.object(object_type, primary_key)?;
        let handle = self.query_for(&key, || {
            let query = ObjectQuery::new(key.clone(), self.weak_self.clone())?;
            Ok(QueryHandle::Object(Arc::new(query)))
        })?;
        match handle {
            QueryHandle::Object(q) => Ok(q),
            other => Err(other.key().kind_mismatch(KeyKind::Object)),
        }
    }

    pub(crate) fn list_query(&self, options: &ListOptions) -> CacheResult<Arc<ListQuery>> {
        let key = self.keys.intern(KeyParams::List {
            object_type: options.object_type.clone(),
            where_clause: self.wheres.canonicalize(&options.where_clause)?,
            order_by: self.orders.canonicalize(&options.order_by)?,
            pivot: options.pivot.clone().filter(|p| !p.is_empty()),
        })?;
        let page_size = options.page_size.or(self.config.default_page_size);
        let handle = self.query_for(&key, || {
            let query = ListQuery::new(
                key.clone(),
                self.weak_self.clone(),
                page_size,
                options.auto_fetch_more,
            )?;
            Ok(QueryHandle::List(Arc::new(query)))
        })?;
        match handle {
            QueryHandle::List(q) => Ok(q),
            other => Err(other.key().kind_mismatch(KeyKind::List)),
        }
    }

    pub(crate) fn interface_list_query(
        &self,
        options: &InterfaceListOptions,
    ) -> CacheResult<Arc<InterfaceListQuery>> {
        let key = self.keys.intern(KeyParams::InterfaceList {
            interface: options.interface.clone(),
            where_clause: self.wheres.canonicalize(&options.where_clause)?,
            order_by: self.orders.canonicalize(&options.order_by)?,
        })?;
        let page_size = options.page_size.or(self.config.default_page_size);
        let handle = self.query_for(&key, || {
            let query = InterfaceListQuery::new(
                key.clone(),
                self.weak_self.clone(),
                page_size,
                options.auto_fetch_more,
            )?;
            Ok(QueryHandle::InterfaceList(Arc::new(query)))
        })?;
        match handle {
            QueryHandle::InterfaceList(q) => Ok(q),
            other => Err(other.key().kind_mismatch(KeyKind::InterfaceList)),
        }
    }

    pub(crate) fn link_query(&self, options: &LinkOptions) -> CacheResult<Arc<LinkQuery>> {
        let key = self.keys.intern(KeyParams::SpecificLink {
            source_type: options.source_type.clone(),
            primary_key: options.primary_key.clone(),
            link: options.link.clone(),
            where_clause: self.wheres.canonicalize(&options.where_clause)?,
            order_by: self.orders.canonicalize(&options.order_by)?,
        })?;
        let page_size = options.page_size.or(self.config.default_page_size);
        let handle = self.query_for(&key, || {
            let query = LinkQuery::new(
                key.clone(),
                self.weak_self.clone(),
                page_size,
                options.auto_fetch_more,
            )?;
            Ok(QueryHandle::Link(Arc::new(query)))
        })?;
        match handle {
            QueryHandle::Link(q) => Ok(q),
            other => Err(other.key().kind_mismatch(KeyKind::SpecificLink)),
        }
    }

    pub(crate) fn aggregation_query(
        &self,
        options: &AggregationOptions,
    ) -> CacheResult<Arc<AggregationQuery>> {
        let key = self.keys.intern(KeyParams::Aggregation {
            object_type: options.object_type.clone(),
            where_clause: self.wheres.canonicalize(&options.where_clause)?,
            aggregate: options.aggregate.clone(),
            pivot: options.pivot.clone().filter(|p| !p.is_empty()),
        })?;
        let handle = self.query_for(&key, || {
            let query = AggregationQuery::new(key.clone(), self.weak_self.clone())?;
            Ok(QueryHandle::Aggregation(Arc::new(query)))
        })?;
        match handle {
            QueryHandle::Aggregation(q) => Ok(q),
            other => Err(other.key().kind_mismatch(KeyKind::Aggregation)),
        }
    }

    fn live_queries(&self) -> CacheResult<Vec<QueryHandle>> {
        Ok(self.lock_queries()?.values().cloned().collect())
    }

    /// Revalidate the query living under `key`, if any, without waiting.
    fn revalidate_in_background(&self, key: &CacheKey, force: bool) {
        let handle = match self.lock_queries() {
            Ok(queries) => queries.get(key).cloned(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            spawn_revalidate(self.weak_self.clone(), handle, force);
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    fn subscribe(
        &self,
        key: &CacheKey,
        observer: Arc<dyn Observer<Payload>>,
    ) -> CacheResult<Subscription> {
        let (subject, observer_id, seq, payload) = {
            let mut state = self.lock_state()?;
            let subject = self.subjects.get_or_create(key);
            let observer_id = subject.add(observer);
            state.refcounts.retain(key);
            let payload = Payload::resolve(key, &state.layers);
            (subject, observer_id, state.seq, payload)
        };
        subject.deliver_initial(observer_id, seq, payload);
        tracing::trace!(cache_key = %key, observer_id, "Subscribed");
        Ok(Subscription::new(self.weak_self.clone(), key.clone(), observer_id))
    }

    pub(crate) fn unsubscribe(&self, key: &CacheKey, observer_id: u64) {
        if let Some(subject) = self.subjects.get(key) {
            subject.remove(observer_id);
        }
        match self.lock_state() {
            Ok(mut state) => state.refcounts.release(key, Instant::now()),
            Err(e) => tracing::warn!(cache_key = %key, error = %e, "Failed to release key"),
        }
    }

    // ------------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------------

    fn gc(&self) -> CacheResult<usize> {
        let now = Instant::now();
        let keep_alive = self.config.key_keep_alive;
        let collected = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            let candidates = self.keys.all()?;
            let busy: HashSet<CacheKey> = self
                .lock_queries()?
                .values()
                .filter(|q| q.is_busy())
                .map(|q| q.key().clone())
                .collect();

            let mut collected = Vec::new();
            for key in candidates {
                if !state.refcounts.is_collectable(&key, now, keep_alive)
                    || state.index.is_listed(&key)
                    || state.layers.has_optimistic(&key)
                    || busy.contains(&key)
                {
                    continue;
                }
                state.layers.remove_base(&key);
                if key.is_collection() {
                    for released in state.index.remove_collection(&key) {
                        state.refcounts.touch(&released, now);
                    }
                }
                state.refcounts.forget(&key);
                self.keys.remove(&key)?;
                collected.push(key);
            }

            let mut queries = self.lock_queries()?;
            for key in &collected {
                queries.remove(key);
            }
            collected
        };

        for key in &collected {
            if let Some(subject) = self.subjects.remove(key) {
                subject.complete();
            }
        }
        let pruned = self.wheres.prune()? + self.orders.prune()?;
        if !collected.is_empty() {
            tracing::debug!(
                collected = collected.len(),
                canonical_pruned = pruned,
                "Collected idle cache keys"
            );
        }
        Ok(collected.len())
    }
}

fn spawn_revalidate(store: Weak<StoreInner>, query: QueryHandle, force: bool) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = query.revalidate(force).await {
                    tracing::warn!(
                        cache_key = %query.key(),
                        error = %e,
                        "Background revalidation failed"
                    );
                    if let Some(store) = store.upgrade() {
                        store.report_error(query.key(), &e);
                    }
                }
            });
        }
        Err(_) => {
            tracing::debug!(
                cache_key = %query.key(),
                "No async runtime; skipping background revalidation"
            );
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Normalized object cache.
///
/// Cheap to clone; clones share one cache. Query objects and subscriptions
/// hold only weak references back to it.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        metadata: Arc<dyn MetadataProvider>,
        config: StoreConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        let metadata = Arc::new(MetadataCache::new(metadata));
        let loader = BulkLoader::new(Arc::clone(&fetcher), Arc::clone(&metadata), &config);
        let inner = Arc::new_cyclic(|weak_self| StoreInner {
            config,
            keys: KeyRegistry::new(),
            wheres: WhereClauseCanonicalizer::new(),
            orders: OrderByCanonicalizer::new(),
            state: Mutex::new(StoreState {
                layers: Layers::new(),
                index: DependentsIndex::new(),
                refcounts: RefCounts::new(),
                seq: 0,
            }),
            subjects: SubjectRegistry::new(),
            queries: Mutex::new(HashMap::new()),
            fetcher,
            metadata,
            loader,
            weak_self: weak_self.clone(),
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Run `f` as one atomic unit of reads and writes.
    ///
    /// If `f` fails nothing it wrote is applied. Otherwise every write lands
    /// in the target layer together, and each subscribed key whose resolved
    /// value changed is notified exactly once before this returns.
    pub fn batch<R, F>(&self, options: BatchOptions, f: F) -> CacheResult<BatchOutcome<R>>
    where
        F: FnOnce(&mut BatchContext<'_>) -> CacheResult<R>,
    {
        self.inner.batch(options, f)
    }

    /// The entry `key` currently resolves to.
    pub fn read(&self, key: &CacheKey) -> CacheResult<Option<Entry>> {
        self.inner.read(key)
    }

    /// The cached snapshot of one object, if any. Deleted objects read as
    /// `None`.
    pub fn read_object(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> CacheResult<Option<Arc<ObjectSnapshot>>> {
        match self.inner.keys.find_object(object_type, primary_key) {
            Some(key) => Ok(self.inner.read(&key)?.as_ref().and_then(Entry::object).cloned()),
            None => Ok(None),
        }
    }

    /// Tear down an optimistic layer and re-notify every key it held.
    ///
    /// The id is retired: later batches targeting it fail.
    pub fn remove_layer(&self, id: OptimisticId) -> CacheResult<Changes> {
        self.inner.remove_layer(id)
    }

    /// Keys currently held by an optimistic layer.
    pub fn optimistic_layer_keys(&self, id: OptimisticId) -> CacheResult<Vec<CacheKey>> {
        self.inner.optimistic_layer_keys(id)
    }

    pub fn canonicalize_where(&self, clause: &WhereClause) -> CacheResult<Canonical<WhereClause>> {
        self.inner.wheres.canonicalize(clause)
    }

    pub fn canonicalize_order_by(&self, order_by: &OrderBy) -> CacheResult<Canonical<OrderBy>> {
        self.inner.orders.canonicalize(order_by)
    }

    /// Interned key for one object.
    pub fn object_key(&self, object_type: &str, primary_key: &PrimaryKey) -> CacheResult<CacheKey> {
        self.inner.keys.object(object_type, primary_key)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_object_query(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> CacheResult<Arc<ObjectQuery>> {
        self.inner.object_query(object_type, primary_key)
    }

    pub fn get_list_query(&self, options: &ListOptions) -> CacheResult<Arc<ListQuery>> {
        self.inner.list_query(options)
    }

    pub fn get_interface_list_query(
        &self,
        options: &InterfaceListOptions,
    ) -> CacheResult<Arc<InterfaceListQuery>> {
        self.inner.interface_list_query(options)
    }

    pub fn get_link_query(&self, options: &LinkOptions) -> CacheResult<Arc<LinkQuery>> {
        self.inner.link_query(options)
    }

    pub fn get_aggregation_query(
        &self,
        options: &AggregationOptions,
    ) -> CacheResult<Arc<AggregationQuery>> {
        self.inner.aggregation_query(options)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Subscribe to one object and start loading it in the background.
    ///
    /// The observer receives the current state immediately.
    pub fn observe_object<O>(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
        observer: O,
    ) -> CacheResult<Subscription>
    where
        O: Observer<ObjectPayload> + 'static,
    {
        let query = self.inner.object_query(object_type, primary_key)?;
        let subscription = self
            .inner
            .subscribe(query.key(), Arc::new(Typed::new(observer)))?;
        spawn_revalidate(Arc::downgrade(&self.inner), QueryHandle::Object(query), false);
        Ok(subscription)
    }

    pub fn observe_list<O>(&self, options: &ListOptions, observer: O) -> CacheResult<Subscription>
    where
        O: Observer<ListPayload> + 'static,
    {
        let query = self.inner.list_query(options)?;
        let subscription = self
            .inner
            .subscribe(query.key(), Arc::new(Typed::new(observer)))?;
        spawn_revalidate(Arc::downgrade(&self.inner), QueryHandle::List(query), false);
        Ok(subscription)
    }

    /// Subscribe to a list over an interface. Members arrive as full
    /// objects of their concrete types.
    pub fn observe_interface_list<O>(
        &self,
        options: &InterfaceListOptions,
        observer: O,
    ) -> CacheResult<Subscription>
    where
        O: Observer<ListPayload> + 'static,
    {
        let query = self.inner.interface_list_query(options)?;
        let subscription = self
            .inner
            .subscribe(query.key(), Arc::new(Typed::new(observer)))?;
        spawn_revalidate(Arc::downgrade(&self.inner), QueryHandle::InterfaceList(query), false);
        Ok(subscription)
    }

    pub fn observe_links<O>(&self, options: &LinkOptions, observer: O) -> CacheResult<Subscription>
    where
        O: Observer<ListPayload> + 'static,
    {
        let query = self.inner.link_query(options)?;
        let subscription = self
            .inner
            .subscribe(query.key(), Arc::new(Typed::new(observer)))?;
        spawn_revalidate(Arc::downgrade(&self.inner), QueryHandle::Link(query), false);
        Ok(subscription)
    }

    pub fn observe_aggregation<O>(
        &self,
        options: &AggregationOptions,
        observer: O,
    ) -> CacheResult<Subscription>
    where
        O: Observer<AggregationPayload> + 'static,
    {
        let query = self.inner.aggregation_query(options)?;
        let subscription = self
            .inner
            .subscribe(query.key(), Arc::new(Typed::new(observer)))?;
        spawn_revalidate(Arc::downgrade(&self.inner), QueryHandle::Aggregation(query), false);
        Ok(subscription)
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Refetch one object if it is cached or queried.
    pub async fn invalidate_object(&self, object_type: &str, primary_key: &PrimaryKey) {
        let Some(key) = self.inner.keys.find_object(object_type, primary_key) else {
            return;
        };
        let result = match self.inner.object_query(object_type, primary_key) {
            Ok(query) => query.revalidate(true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(cache_key = %key, error = %e, "Object invalidation failed");
        }
    }

    pub async fn invalidate_objects(&self, objects: &[(String, PrimaryKey)]) {
        join_all(
            objects
                .iter()
                .map(|(object_type, primary_key)| self.invalidate_object(object_type, primary_key)),
        )
        .await;
    }

    /// Revalidate every query that depends on `object_type`.
    ///
    /// Returns how many queries revalidated. Failures are logged, not
    /// returned.
    pub async fn invalidate_object_type(&self, object_type: &str) -> usize {
        let queries = match self.inner.live_queries() {
            Ok(queries) => queries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list queries for invalidation");
                return 0;
            }
        };
        let results = join_all(
            queries
                .iter()
                .map(|q| q.invalidate_object_type(object_type)),
        )
        .await;

        let mut revalidated = 0;
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(true) => revalidated += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    cache_key = %query.key(),
                    object_type,
                    error = %e,
                    "Type invalidation failed"
                ),
            }
        }
        tracing::debug!(object_type, revalidated, "Invalidated object type");
        revalidated
    }

    /// Revalidate every live query.
    pub async fn invalidate_all(&self) {
        let queries = match self.inner.live_queries() {
            Ok(queries) => queries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list queries for invalidation");
                return;
            }
        };
        let results = join_all(queries.iter().map(|q| q.revalidate(true))).await;
        for (query, result) in queries.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(cache_key = %query.key(), error = %e, "Invalidation failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Drop every key that has been unreferenced for the keep-alive period.
    ///
    /// Keys still listed by a collection, held by an optimistic layer, or
    /// being fetched are kept. Collecting a key completes its subject and
    /// disposes its query. Returns how many keys were collected.
    pub fn gc(&self) -> CacheResult<usize> {
        self.inner.gc()
    }

    /// Run [`Store::gc`] every `gc_interval` until `shutdown` flips to true
    /// or the store is dropped.
    pub fn spawn_gc(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::downgrade(&self.inner);
        let period = self.inner.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(gc_interval_ms = period.as_millis() as u64, "Cache GC task started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Cache GC task shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = store.upgrade() else {
                            tracing::info!("Store dropped; cache GC task exiting");
                            break;
                        };
                        if let Err(e) = inner.gc() {
                            tracing::error!(error = %e, "Cache GC cycle failed");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CacheResult<StoreStats> {
        let (optimistic_layers, base_entries) = {
            let state = self.inner.lock_state()?;
            (state.layers.optimistic_layer_count(), state.layers.base_len())
        };
        Ok(StoreStats {
            keys: self.inner.keys.len(),
            queries: self.inner.lock_queries()?.len(),
            subjects: self.inner.subjects.len(),
            optimistic_layers,
            base_entries,
            bulk_batches: self.inner.loader.batches_issued(),
        })
    }

    /// The loader object queries fetch through.
    pub fn bulk_loader(&self) -> &BulkLoader {
        &self.inner.loader
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.inner.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{AggregateRequest, LinkRequest, Page, PageRequest};
    use crate::layer::{EntryState, EntryValue};
    use async_trait::async_trait;
    use lamina_core::{AggregationResult, FetchError, ObjectMetadata, Status};
    use std::time::Duration;

    struct Offline;

    #[async_trait]
    impl ObjectFetcher for Offline {
        async fn fetch_page(&self, _request: PageRequest) -> Result<Page, FetchError> {
            Err(FetchError::transient("offline"))
        }

        async fn fetch_one(
            &self,
            _object_type: &str,
            _primary_key: &PrimaryKey,
        ) -> Result<ObjectSnapshot, FetchError> {
            Err(FetchError::transient("offline"))
        }

        async fn fetch_linked(&self, _request: LinkRequest) -> Result<Page, FetchError> {
            Err(FetchError::transient("offline"))
        }

        async fn aggregate(
            &self,
            _request: AggregateRequest,
        ) -> Result<AggregationResult, FetchError> {
            Err(FetchError::transient("offline"))
        }
    }

    #[async_trait]
    impl MetadataProvider for Offline {
        async fn fetch_metadata(&self, object_type: &str) -> Result<ObjectMetadata, FetchError> {
            Ok(ObjectMetadata::new(object_type, "id"))
        }
    }

    fn store(config: StoreConfig) -> Store {
        Store::new(Arc::new(Offline), Arc::new(Offline), config).unwrap()
    }

    fn snapshot(pk: i64, name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new("Employee", pk).with_property("name", name)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig::default().with_bulk_load_max_batch(0);
        assert!(Store::new(Arc::new(Offline), Arc::new(Offline), config).is_err());
    }

    #[test]
    fn test_failed_batch_leaves_no_trace() {
        let store = store(StoreConfig::default());
        let result: CacheResult<BatchOutcome<()>> = store.batch(BatchOptions::base(), |batch| {
            batch.write_object(snapshot(1, "Ada"))?;
            Err(InvariantError::LockPoisoned.into())
        });
        assert!(result.is_err());
        assert!(store.read_object("Employee", &PrimaryKey::from(1)).unwrap().is_none());
    }

    #[test]
    fn test_identical_write_is_skipped() {
        let store = store(StoreConfig::default());
        let first = store
            .batch(BatchOptions::base(), |b| b.write_object(snapshot(1, "Ada")))
            .unwrap();
        assert_eq!(first.changes.len(), 1);
        assert_eq!(first.changes.written_objects, vec![first.value.clone()]);

        let second = store
            .batch(BatchOptions::base(), |b| b.write_object(snapshot(1, "Ada")))
            .unwrap();
        assert!(second.changes.is_empty());
    }

    #[test]
    fn test_delete_reports_tombstone() {
        let store = store(StoreConfig::default());
        let key = store
            .batch(BatchOptions::base(), |b| b.write_object(snapshot(1, "Ada")))
            .unwrap()
            .value;
        let outcome = store
            .batch(BatchOptions::base(), |b| {
                b.delete(&key);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome.changes.deleted_objects, vec![key.clone()]);
        assert!(store.read(&key).unwrap().unwrap().is_tombstone());
        assert!(store.read_object("Employee", &PrimaryKey::from(1)).unwrap().is_none());
    }

    #[test]
    fn test_writes_to_removed_layer_fail() {
        let store = store(StoreConfig::default());
        let id = OptimisticId::new();
        store
            .batch(BatchOptions::optimistic(id), |b| b.write_object(snapshot(1, "Ada")))
            .unwrap();
        store.remove_layer(id).unwrap();
        let again = store.batch(BatchOptions::optimistic(id), |b| b.write_object(snapshot(1, "Bo")));
        assert!(matches!(
            again,
            Err(lamina_core::CacheError::Invariant(InvariantError::LayerRetired { .. }))
        ));
    }

    #[test]
    fn test_member_change_re_emits_collection() {
        let store = store(StoreConfig::default());
        let list = store
            .inner
            .keys
            .intern(KeyParams::List {
                object_type: "Team".to_string(),
                where_clause: store.canonicalize_where(&WhereClause::all()).unwrap(),
                order_by: store.canonicalize_order_by(&OrderBy::none()).unwrap(),
                pivot: None,
            })
            .unwrap();
        let member = store
            .batch(BatchOptions::base(), |b| {
                let member = b.write_object(snapshot(1, "Ada"))?;
                b.write(
                    &list,
                    EntryState::Loaded(EntryValue::Collection(Arc::new(
                        crate::layer::CollectionData {
                            members: vec![member.clone()],
                            ..Default::default()
                        },
                    ))),
                );
                Ok(member)
            })
            .unwrap()
            .value;

        let outcome = store
            .batch(BatchOptions::base(), |b| b.write_object(snapshot(1, "Ada K")))
            .unwrap();
        assert!(outcome.changes.contains(&member));
        assert!(outcome.changes.contains(&list));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_collects_idle_keys_only() {
        let store = store(StoreConfig::default().with_key_keep_alive(Duration::from_secs(5)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store
            .observe_object("Employee", &PrimaryKey::from(1), move |p: ObjectPayload| {
                sink.lock().unwrap().push(p.status)
            })
            .unwrap();
        store
            .batch(BatchOptions::base(), |b| b.write_object(snapshot(2, "Idle")))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let query = store.get_object_query("Employee", &PrimaryKey::from(1)).unwrap();
        if let Some(flight) = query.core.in_flight() {
            flight.await.unwrap();
        }
        assert_eq!(store.gc().unwrap(), 1);
        assert!(store.read_object("Employee", &PrimaryKey::from(2)).unwrap().is_none());

        drop(subscription);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.gc().unwrap(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.gc().unwrap(), 1);
        assert_eq!(store.stats().unwrap().keys, 0);
        assert_eq!(seen.lock().unwrap().first(), Some(&Status::Init));
    }
}
