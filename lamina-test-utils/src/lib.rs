//! LAMINA Test Utilities
//!
//! Shared test infrastructure for the lamina workspace:
//! - An in-memory fetcher and metadata provider with call logs
//! - A recording observer
//! - Proptest generators for clauses and snapshots
//! - Fixtures for a small employee/office/region schema

pub use lamina_core::{
    AggregateSpec, AggregationBucket, AggregationResult, CacheError, CacheResult, FetchError,
    FilterOperator, ObjectMetadata, ObjectSnapshot, OrderBy, PivotInfo, PrimaryKey,
    PropertyFilter, Status, StoreConfig, WhereClause,
};
pub use lamina_store::{
    AggregateRequest, LinkRequest, MetadataProvider, ObjectFetcher, Observer, Page, PageRequest,
    Store, TypeKind,
};

use async_trait::async_trait;
use lamina_core::compare_values;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// One call received by [`MockFetcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchCall {
    Page(PageRequest),
    One {
        object_type: String,
        primary_key: PrimaryKey,
    },
    Linked(LinkRequest),
    Aggregate(AggregateRequest),
}

impl FetchCall {
    pub fn object_type(&self) -> &str {
        match self {
            Self::Page(r) => &r.object_type,
            Self::One { object_type, .. } => object_type,
            Self::Linked(r) => &r.source_type,
            Self::Aggregate(r) => &r.object_type,
        }
    }
}

#[derive(Default)]
struct MockData {
    objects: HashMap<String, Vec<ObjectSnapshot>>,
    links: HashMap<(String, PrimaryKey, String), Vec<PrimaryKey>>,
    aggregations: HashMap<String, AggregationResult>,
    failures: HashMap<String, FetchError>,
    calls: Vec<FetchCall>,
}

/// In-memory stand-in for the remote data service.
///
/// Objects are kept per type in insertion order. Page tokens are offsets.
/// Clauses are evaluated loosely, the way a server that understands every
/// operator would.
#[derive(Clone, Default)]
pub struct MockFetcher {
    data: Arc<Mutex<MockData>>,
    latency: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace an object.
    pub fn insert(&self, object: ObjectSnapshot) {
        let mut data = self.lock();
        let objects = data.objects.entry(object.object_type.clone()).or_default();
        match objects
            .iter_mut()
            .find(|o| o.primary_key == object.primary_key)
        {
            Some(existing) => *existing = object,
            None => objects.push(object),
        }
    }

    pub fn insert_all(&self, objects: impl IntoIterator<Item = ObjectSnapshot>) {
        for object in objects {
            self.insert(object);
        }
    }

    pub fn remove(&self, object_type: &str, primary_key: &PrimaryKey) {
        if let Some(objects) = self.lock().objects.get_mut(object_type) {
            objects.retain(|o| &o.primary_key != primary_key);
        }
    }

    /// Link `source` to `targets` through `link`.
    pub fn link(
        &self,
        source_type: &str,
        source: impl Into<PrimaryKey>,
        link: &str,
        targets: impl IntoIterator<Item = PrimaryKey>,
    ) {
        self.lock().links.insert(
            (source_type.to_string(), source.into(), link.to_string()),
            targets.into_iter().collect(),
        );
    }

    pub fn set_aggregation(&self, object_type: &str, result: AggregationResult) {
        self.lock()
            .aggregations
            .insert(object_type.to_string(), result);
    }

    /// Fail every request for `object_type` with `error` until cleared.
    pub fn fail_type(&self, object_type: &str, error: FetchError) {
        self.lock().failures.insert(object_type.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls_for(&self, object_type: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.object_type() == object_type)
            .count()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    async fn record(&self, call: FetchCall) -> Result<(), FetchError> {
        let failure = {
            let mut data = self.lock();
            let failure = data.failures.get(call.object_type()).cloned();
            data.calls.push(call);
            failure
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn find(&self, object_type: &str, primary_key: &PrimaryKey) -> Option<ObjectSnapshot> {
        self.lock()
            .objects
            .get(object_type)?
            .iter()
            .find(|o| &o.primary_key == primary_key)
            .cloned()
    }

    fn linked(&self, source_type: &str, source: &PrimaryKey, link: &str) -> Vec<PrimaryKey> {
        self.lock()
            .links
            .get(&(source_type.to_string(), source.clone(), link.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn matching(&self, object_type: &str, where_clause: &WhereClause) -> Vec<ObjectSnapshot> {
        self.lock()
            .objects
            .get(object_type)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| where_clause.matches(o, false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Follow `links` from `sources`, keeping each reached object once.
    fn pivot(
        &self,
        mut object_type: String,
        mut sources: Vec<ObjectSnapshot>,
        links: &[String],
        metadata: &MockMetadata,
    ) -> Vec<ObjectSnapshot> {
        for link in links {
            let target_type = metadata
                .lookup(&object_type)
                .and_then(|m| m.link_target(link).map(str::to_string))
                .unwrap_or_default();
            let mut seen = HashSet::new();
            let mut reached = Vec::new();
            for source in &sources {
                for pk in self.linked(&object_type, &source.primary_key, link) {
                    if seen.insert(pk.clone()) {
                        if let Some(target) = self.find(&target_type, &pk) {
                            reached.push(target);
                        }
                    }
                }
            }
            object_type = target_type;
            sources = reached;
        }
        sources
    }
}

fn sort_objects(objects: &mut [ObjectSnapshot], order_by: &OrderBy) {
    if order_by.is_empty() {
        return;
    }
    objects.sort_by(|a, b| {
        for term in &order_by.terms {
            let ordering = match (a.property(&term.property), b.property(&term.property)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match term.direction {
                lamina_core::SortDirection::Asc => ordering,
                lamina_core::SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn paginate(all: Vec<ObjectSnapshot>, page_size: Option<u32>, page_token: Option<&str>) -> Page {
    let total = all.len();
    let start = page_token
        .and_then(|t| t.parse::<usize>().ok())
        .unwrap_or(0)
        .min(total);
    let end = match page_size {
        Some(size) => (start + size as usize).min(total),
        None => total,
    };
    Page {
        data: all[start..end].to_vec(),
        next_page_token: (end < total).then(|| end.to_string()),
        total_count: Some(total as u64),
    }
}

/// A [`MockFetcher`] bound to the metadata it needs to follow pivots.
#[derive(Clone)]
pub struct MockService {
    pub fetcher: MockFetcher,
    pub metadata: MockMetadata,
}

impl MockService {
    pub fn new(fetcher: MockFetcher, metadata: MockMetadata) -> Self {
        Self { fetcher, metadata }
    }

    /// A store backed by this service.
    pub fn store(&self, config: StoreConfig) -> CacheResult<Store> {
        Store::new(
            Arc::new(self.clone()),
            Arc::new(self.metadata.clone()),
            config,
        )
    }
}

impl MockService {
    /// Objects of every implementing type, trimmed to their primary key the
    /// way a bare interface view would be.
    fn interface_page(&self, request: &PageRequest) -> Page {
        let implementers = self.metadata.implementers(&request.object_type);
        let mut objects: Vec<ObjectSnapshot> = implementers
            .iter()
            .flat_map(|m| self.fetcher.matching(&m.api_name, &request.where_clause))
            .collect();
        sort_objects(&mut objects, &request.order_by);
        let mut page = paginate(objects, request.page_size, request.page_token.as_deref());
        page.data = page
            .data
            .into_iter()
            .map(|full| {
                let pk_field = implementers
                    .iter()
                    .find(|m| m.api_name == full.object_type)
                    .map(|m| m.primary_key_field.clone())
                    .unwrap_or_default();
                ObjectSnapshot::new(full.object_type, full.primary_key.clone())
                    .with_property(pk_field, full.primary_key.to_value())
            })
            .collect();
        page
    }
}

#[async_trait]
impl ObjectFetcher for MockService {
    async fn fetch_page(&self, request: PageRequest) -> Result<Page, FetchError> {
        self.fetcher.record(FetchCall::Page(request.clone())).await?;
        if request.type_kind == TypeKind::Interface {
            return Ok(self.interface_page(&request));
        }
        let sources = self
            .fetcher
            .matching(&request.object_type, &request.where_clause);
        let mut objects = match &request.pivot {
            Some(pivot) => self.fetcher.pivot(
                request.object_type.clone(),
                sources,
                &pivot.links,
                &self.metadata,
            ),
            None => sources,
        };
        sort_objects(&mut objects, &request.order_by);
        Ok(paginate(
            objects,
            request.page_size,
            request.page_token.as_deref(),
        ))
    }

    async fn fetch_one(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> Result<ObjectSnapshot, FetchError> {
        self.fetcher
            .record(FetchCall::One {
                object_type: object_type.to_string(),
                primary_key: primary_key.clone(),
            })
            .await?;
        self.fetcher
            .find(object_type, primary_key)
            .ok_or_else(|| FetchError::not_found(object_type, primary_key.clone()))
    }

    async fn fetch_linked(&self, request: LinkRequest) -> Result<Page, FetchError> {
        self.fetcher
            .record(FetchCall::Linked(request.clone()))
            .await?;
        let source = self
            .fetcher
            .find(&request.source_type, &request.primary_key)
            .ok_or_else(|| {
                FetchError::not_found(request.source_type.clone(), request.primary_key.clone())
            })?;
        let mut objects: Vec<ObjectSnapshot> = self
            .fetcher
            .pivot(
                request.source_type.clone(),
                vec![source],
                std::slice::from_ref(&request.link),
                &self.metadata,
            )
            .into_iter()
            .filter(|o| request.where_clause.matches(o, false))
            .collect();
        sort_objects(&mut objects, &request.order_by);
        Ok(paginate(
            objects,
            request.page_size,
            request.page_token.as_deref(),
        ))
    }

    async fn aggregate(&self, request: AggregateRequest) -> Result<AggregationResult, FetchError> {
        let object_type = request.object_type.clone();
        self.fetcher.record(FetchCall::Aggregate(request)).await?;
        Ok(self
            .fetcher
            .lock()
            .aggregations
            .get(&object_type)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// MOCK METADATA
// ============================================================================

/// Metadata provider serving a fixed set of types.
#[derive(Clone, Default)]
pub struct MockMetadata {
    types: Arc<Mutex<HashMap<String, ObjectMetadata>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(self, metadata: ObjectMetadata) -> Self {
        self.types
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(metadata.api_name.clone(), metadata);
        self
    }

    /// Types requested so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Types implementing `interface`, by name.
    fn implementers(&self, interface: &str) -> Vec<ObjectMetadata> {
        let mut found: Vec<ObjectMetadata> = self
            .types
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|m| m.implements(interface))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.api_name.cmp(&b.api_name));
        found
    }

    fn lookup(&self, object_type: &str) -> Option<ObjectMetadata> {
        self.types
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(object_type)
            .cloned()
    }
}

#[async_trait]
impl MetadataProvider for MockMetadata {
    async fn fetch_metadata(&self, object_type: &str) -> Result<ObjectMetadata, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(object_type.to_string());
        self.lookup(object_type).ok_or_else(|| FetchError::Metadata {
            object_type: object_type.to_string(),
            reason: "unknown object type".to_string(),
        })
    }
}

// ============================================================================
// RECORDING OBSERVER
// ============================================================================

struct Recorded<T> {
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<String>>,
    completed: Mutex<bool>,
    changed: Notify,
}

/// Observer that keeps every value it receives.
///
/// Clones share the same record, so one clone can be handed to the store
/// while the test inspects another.
pub struct RecordingObserver<T> {
    inner: Arc<Recorded<T>>,
}

impl<T> Clone for RecordingObserver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RecordingObserver<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Recorded {
                values: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                completed: Mutex::new(false),
                changed: Notify::new(),
            }),
        }
    }
}

impl<T: Clone> RecordingObserver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<T> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<T> {
        self.values().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_completed(&self) -> bool {
        *self
            .inner
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until the latest value satisfies `predicate`.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within five seconds.
    pub async fn wait_for<P>(&self, predicate: P) -> T
    where
        P: Fn(&T) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(value) = self.last().filter(|v| predicate(v)) {
                    return value;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(value) => value,
            Err(_) => panic!(
                "observer never saw a matching value after {} values",
                self.len()
            ),
        }
    }
}

impl<T: Clone + Send + Sync> Observer<T> for RecordingObserver<T> {
    fn next(&self, value: T) {
        self.inner
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value);
        self.inner.changed.notify_waiters();
    }

    fn error(&self, error: &CacheError) {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error.to_string());
        self.inner.changed.notify_waiters();
    }

    fn complete(&self) {
        *self
            .inner
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.inner.changed.notify_waiters();
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    pub fn arb_field() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["name", "age", "office", "title", "active"])
            .prop_map(str::to_string)
    }

    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    pub fn arb_operator() -> impl Strategy<Value = FilterOperator> {
        prop::sample::select(vec![
            FilterOperator::Eq,
            FilterOperator::Ne,
            FilterOperator::Gt,
            FilterOperator::Lt,
            FilterOperator::Gte,
            FilterOperator::Lte,
            FilterOperator::Contains,
            FilterOperator::StartsWith,
        ])
    }

    pub fn arb_property_filter() -> impl Strategy<Value = PropertyFilter> {
        prop_oneof![
            arb_scalar().prop_map(PropertyFilter::Equals),
            prop::collection::btree_map(arb_operator(), arb_scalar(), 1..3)
                .prop_map(PropertyFilter::Operators),
        ]
    }

    /// Where clauses up to three levels deep.
    pub fn arb_where_clause() -> impl Strategy<Value = WhereClause> {
        let leaf = prop::collection::btree_map(arb_field(), arb_property_filter(), 0..3)
            .prop_map(WhereClause::Properties);
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(WhereClause::And),
                prop::collection::vec(inner.clone(), 0..4).prop_map(WhereClause::Or),
                inner.prop_map(WhereClause::not),
            ]
        })
    }

    pub fn arb_order_by() -> impl Strategy<Value = OrderBy> {
        prop::collection::vec((arb_field(), any::<bool>()), 0..3).prop_map(|terms| {
            terms.into_iter().fold(OrderBy::none(), |order, (field, asc)| {
                if asc {
                    order.asc(field)
                } else {
                    order.desc(field)
                }
            })
        })
    }

    pub fn arb_employee() -> impl Strategy<Value = ObjectSnapshot> {
        (1i64..1000, "[A-Z][a-z]{2,8}", 18i64..70)
            .prop_map(|(pk, name, age)| super::fixtures::employee(pk, &name).with_property("age", age))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub fn employee(pk: i64, name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new("Employee", pk)
            .with_property("id", pk)
            .with_property("name", name)
    }

    pub fn office(pk: i64, city: &str) -> ObjectSnapshot {
        ObjectSnapshot::new("Office", pk)
            .with_property("id", pk)
            .with_property("city", city)
    }

    pub fn region(pk: i64, name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new("Region", pk)
            .with_property("id", pk)
            .with_property("name", name)
    }

    /// Employee -office-> Office -region-> Region, plus Office -employees->
    /// Employee. Employees and regions implement the `Named` interface.
    pub fn org_metadata() -> MockMetadata {
        MockMetadata::new()
            .with_type(
                ObjectMetadata::new("Employee", "id")
                    .with_property("name")
                    .with_link("office", "Office", false)
                    .with_interface("Named"),
            )
            .with_type(
                ObjectMetadata::new("Office", "id")
                    .with_property("city")
                    .with_link("region", "Region", false)
                    .with_link("employees", "Employee", true),
            )
            .with_type(
                ObjectMetadata::new("Region", "id")
                    .with_property("name")
                    .with_interface("Named"),
            )
    }

    /// The org schema with no objects loaded.
    pub fn org_service() -> MockService {
        MockService::new(MockFetcher::new(), org_metadata())
    }

    /// Config with no bulk-load debounce surprises in tests.
    pub fn test_config() -> StoreConfig {
        StoreConfig::default().with_bulk_load_window(Duration::from_millis(5))
    }
}
