//! List queries and the paging machinery shared with link queries.
//!
//! A collection entry stores member keys, never objects. Fetched objects are
//! written under their own keys in the same batch, so an object that appears
//! in three lists is cached once and every list sees its latest value.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lamina_core::{
    CacheResult, FetchError, MatchKind, OrderBy, PivotInfo, WhereClause,
};

use super::invalidation::traversal_types;
use super::{QueryCore, SingleFlight};
use crate::batch::{BatchContext, BatchOptions};
use crate::cache_key::{CacheKey, KeyKind, KeyParams};
use crate::canonical::Canonical;
use crate::fetcher::{Page, PageRequest, TypeKind};
use crate::layer::{CollectionData, Entry, EntryState, EntryValue};
use crate::sorting::{strategy_for, SortingStrategy};
use crate::store::StoreInner;

// ============================================================================
// OPTIONS
// ============================================================================

/// How many pages a collection query loads on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoFetchMore {
    /// Only the first page; callers page with `fetch_more`.
    #[default]
    None,
    /// Every page.
    All,
    /// Pages until at least this many members are loaded.
    AtLeast(usize),
}

impl AutoFetchMore {
    fn wants_more(self, loaded: usize) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::AtLeast(n) => loaded < n,
        }
    }
}

/// Parameters of a list query.
///
/// `page_size` and `auto_fetch_more` shape how the query pages, not which
/// key it lives under: the first caller for a key decides them.
#[derive(Debug, Clone, PartialEq)]
pub struct ListOptions {
    pub object_type: String,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub pivot: Option<PivotInfo>,
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
}

impl ListOptions {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            where_clause: WhereClause::all(),
            order_by: OrderBy::none(),
            pivot: None,
            page_size: None,
            auto_fetch_more: AutoFetchMore::None,
        }
    }

    pub fn with_where(mut self, where_clause: WhereClause) -> Self {
        self.where_clause = where_clause;
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Traverse these links from the matching objects.
    pub fn with_pivot(mut self, pivot: PivotInfo) -> Self {
        self.pivot = Some(pivot);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_auto_fetch_more(mut self, auto_fetch_more: AutoFetchMore) -> Self {
        self.auto_fetch_more = auto_fetch_more;
        self
    }
}

// ============================================================================
// PAGING
// ============================================================================

/// Fetches one page of a collection.
#[async_trait]
pub(crate) trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        store: &StoreInner,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<Page, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageMode {
    Replace,
    Append,
}

/// Paging state of one collection query.
pub(crate) struct Paging {
    page_size: Option<u32>,
    auto_fetch_more: AutoFetchMore,
    more: SingleFlight,
    sorting: Box<dyn SortingStrategy>,
}

impl Paging {
    pub(crate) fn new(
        page_size: Option<u32>,
        auto_fetch_more: AutoFetchMore,
        order_by: &Canonical<OrderBy>,
    ) -> Self {
        Self {
            page_size,
            auto_fetch_more,
            more: SingleFlight::new(),
            sorting: strategy_for(order_by),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.more.is_running()
    }

    pub(crate) fn sorting(&self) -> &dyn SortingStrategy {
        self.sorting.as_ref()
    }

    /// Replace the collection with its first page, then auto-page.
    pub(crate) async fn load(
        &self,
        core: &QueryCore,
        source: &dyn PageSource,
        store: &StoreInner,
    ) -> CacheResult<()> {
        core.mark_loading(store)?;
        tracing::debug!(cache_key = %core.key(), "Revalidating collection");
        match source.fetch_page(store, self.page_size, None).await {
            Ok(page) => self.write_page(store, core.key(), page, PageMode::Replace)?,
            Err(e) => return core.write_error(store, e),
        }
        self.fill(core, source, store).await
    }

    /// Append the next page, single-flight. A no-op without a page token.
    pub(crate) async fn fetch_more<S>(&self, core: &QueryCore, source: Arc<S>) -> CacheResult<()>
    where
        S: PageSource + AsRef<QueryCore> + AsRef<Paging> + 'static,
    {
        if let Some(revalidating) = core.in_flight() {
            revalidating.await?;
        }
        let store = core.store()?;
        self.more
            .run(move || async move {
                let core: &QueryCore = (*source).as_ref();
                let paging: &Paging = (*source).as_ref();
                paging.next_page(core, &*source, &store).await.map(|_| ())
            })
            .await
    }

    async fn next_page(
        &self,
        core: &QueryCore,
        source: &dyn PageSource,
        store: &StoreInner,
    ) -> CacheResult<bool> {
        let token = store
            .read(core.key())?
            .as_ref()
            .and_then(Entry::collection)
            .and_then(|c| c.next_page_token.clone());
        let Some(token) = token else {
            return Ok(false);
        };
        tracing::debug!(cache_key = %core.key(), "Fetching next page");
        match source.fetch_page(store, self.page_size, Some(token)).await {
            Ok(page) => {
                self.write_page(store, core.key(), page, PageMode::Append)?;
                Ok(true)
            }
            Err(e) => {
                core.write_error(store, e)?;
                Ok(false)
            }
        }
    }

    async fn fill(
        &self,
        core: &QueryCore,
        source: &dyn PageSource,
        store: &StoreInner,
    ) -> CacheResult<()> {
        loop {
            let loaded = store
                .read(core.key())?
                .as_ref()
                .and_then(Entry::collection)
                .map(|c| (c.members.len(), c.has_more()));
            let Some((count, has_more)) = loaded else {
                return Ok(());
            };
            if !has_more || !self.auto_fetch_more.wants_more(count) {
                return Ok(());
            }
            if !self.next_page(core, source, store).await? {
                return Ok(());
            }
        }
    }

    fn write_page(
        &self,
        store: &StoreInner,
        key: &CacheKey,
        page: Page,
        mode: PageMode,
    ) -> CacheResult<()> {
        store.batch(BatchOptions::base(), |batch| {
            let previous = match mode {
                PageMode::Replace => None,
                PageMode::Append => batch.read_own(key).and_then(Entry::collection).cloned(),
            };
            let mut members = previous
                .as_ref()
                .map(|c| c.members.clone())
                .unwrap_or_default();
            let mut seen: HashSet<CacheKey> = members.iter().cloned().collect();
            for object in page.data {
                let member = batch.write_object(object)?;
                if seen.insert(member.clone()) {
                    members.push(member);
                }
            }
            let total_count = page
                .total_count
                .or_else(|| previous.as_ref().and_then(|c| c.total_count));
            batch.write(
                key,
                EntryState::Loaded(EntryValue::Collection(Arc::new(CollectionData {
                    members,
                    total_count,
                    next_page_token: page.next_page_token,
                }))),
            );
            Ok(())
        })?;
        Ok(())
    }
}

// ============================================================================
// LIST QUERY
// ============================================================================

/// Query for every object of a type matching a clause, optionally pivoted
/// through links.
pub struct ListQuery {
    pub(crate) core: QueryCore,
    object_type: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    pivot: Option<PivotInfo>,
    paging: Paging,
}

impl ListQuery {
    pub(crate) fn new(
        key: CacheKey,
        store: Weak<StoreInner>,
        page_size: Option<u32>,
        auto_fetch_more: AutoFetchMore,
    ) -> CacheResult<Self> {
        let (object_type, where_clause, order_by, pivot) = match key.params() {
            KeyParams::List {
                object_type,
                where_clause,
                order_by,
                pivot,
            } => (
                object_type.clone(),
                where_clause.clone(),
                order_by.clone(),
                pivot.clone(),
            ),
            _ => return Err(key.kind_mismatch(KeyKind::List)),
        };
        Ok(Self {
            paging: Paging::new(page_size, auto_fetch_more, &order_by),
            core: QueryCore::new(key, store),
            object_type,
            where_clause,
            order_by,
            pivot,
        })
    }

    pub fn key(&self) -> &CacheKey {
        self.core.key()
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn where_clause(&self) -> &Canonical<WhereClause> {
        &self.where_clause
    }

    pub fn order_by(&self) -> &Canonical<OrderBy> {
        &self.order_by
    }

    pub fn pivot(&self) -> Option<&PivotInfo> {
        self.pivot.as_ref()
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.core.is_busy() || self.paging.is_busy()
    }

    /// Reload from the first page. Concurrent calls share one fetch.
    ///
    /// A non-forced load of a list with nothing cached first tries to reuse
    /// a fully loaded sibling list that differs only in ordering.
    pub async fn revalidate(self: &Arc<Self>, force: bool) -> CacheResult<()> {
        let this = Arc::clone(self);
        self.core
            .revalidate(force, move || async move { this.load(force).await })
            .await
    }

    async fn load(&self, force: bool) -> CacheResult<()> {
        let store = self.core.store()?;
        if !force && self.seed_from_sibling(&store)? {
            tracing::debug!(cache_key = %self.key(), "Seeded list from a reordered sibling");
            return Ok(());
        }
        self.paging.load(&self.core, self, &store).await
    }

    /// Append the next page. Waits for an in-flight revalidation first.
    pub async fn fetch_more(self: &Arc<Self>) -> CacheResult<()> {
        self.paging.fetch_more(&self.core, Arc::clone(self)).await
    }

    fn seed_from_sibling(&self, store: &StoreInner) -> CacheResult<bool> {
        if self.pivot.is_some() {
            return Ok(false);
        }
        let key = self.key().clone();
        let outcome = store.batch(BatchOptions::base(), |batch| {
            if batch.read_own(&key).is_some() {
                return Ok(false);
            }
            for sibling in batch.lists_of_type(&self.object_type) {
                if sibling == key {
                    continue;
                }
                let same_filter = matches!(
                    sibling.params(),
                    KeyParams::List { where_clause, pivot: None, .. }
                        if where_clause.ptr_eq(&self.where_clause)
                );
                if !same_filter {
                    continue;
                }
                let collection = match batch.read_own(&sibling).map(|e| &e.state) {
                    Some(EntryState::Loaded(EntryValue::Collection(c))) if !c.has_more() => {
                        Arc::clone(c)
                    }
                    _ => continue,
                };
                let members = self
                    .paging
                    .sorting()
                    .sort_cache_keys(collection.members.clone(), batch);
                batch.write(
                    &key,
                    EntryState::Loaded(EntryValue::Collection(Arc::new(CollectionData {
                        members,
                        total_count: collection.total_count,
                        next_page_token: None,
                    }))),
                );
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(outcome.value)
    }

    /// Object types whose invalidation concerns this list: its own type and
    /// every type a pivot passes through.
    pub async fn ensure_invalidation_types_ready(&self) -> CacheResult<&HashSet<String>> {
        self.core
            .invalidation_types(|| self.resolve_invalidation_types())
            .await
    }

    async fn resolve_invalidation_types(&self) -> CacheResult<HashSet<String>> {
        match &self.pivot {
            None => Ok(HashSet::from([self.object_type.clone()])),
            Some(pivot) => {
                let store = self.core.store()?;
                Ok(traversal_types(&store.metadata, &self.object_type, &pivot.links).await?)
            }
        }
    }

    pub async fn invalidate_object_type(self: &Arc<Self>, object_type: &str) -> CacheResult<bool> {
        if !self
            .ensure_invalidation_types_ready()
            .await?
            .contains(object_type)
        {
            return Ok(false);
        }
        self.revalidate(true).await?;
        Ok(true)
    }
}

#[async_trait]
impl PageSource for ListQuery {
    async fn fetch_page(
        &self,
        store: &StoreInner,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<Page, FetchError> {
        store
            .fetcher
            .fetch_page(PageRequest {
                object_type: self.object_type.clone(),
                type_kind: TypeKind::Object,
                where_clause: (*self.where_clause).clone(),
                order_by: (*self.order_by).clone(),
                pivot: self.pivot.clone(),
                page_size,
                page_token,
            })
            .await
    }
}

impl AsRef<QueryCore> for ListQuery {
    fn as_ref(&self) -> &QueryCore {
        &self.core
    }
}

impl AsRef<Paging> for ListQuery {
    fn as_ref(&self) -> &Paging {
        &self.paging
    }
}

// ============================================================================
// AUTO-UPDATE
// ============================================================================

/// Fold the objects a batch wrote into every loaded, unpivoted list of
/// their type.
///
/// Strict matches are inserted and the list re-sorted. Objects that no
/// longer match are dropped, but only by base writes. Tombstoned objects are
/// dropped from lists in the batch's own layer. Lists and objects are read
/// as seen from the batch's layer, so a base batch never folds optimistic
/// membership into confirmed data. Returns the lists holding an object only
/// the server can classify; those need a forced revalidation.
pub(crate) fn sync_lists_with_writes(batch: &mut BatchContext<'_>) -> Vec<CacheKey> {
    let mut by_type: HashMap<String, Vec<CacheKey>> = HashMap::new();
    for object in batch.written_objects() {
        by_type
            .entry(object.object_type().to_string())
            .or_default()
            .push(object);
    }

    let mut needs_revalidation = Vec::new();
    for (object_type, objects) in by_type {
        for list in batch.lists_of_type(&object_type) {
            if batch.has_pending(&list) {
                continue;
            }
            let KeyParams::List {
                where_clause,
                order_by,
                ..
            } = list.params()
            else {
                continue;
            };
            let collection = match batch.read_layer(&list).map(|e| &e.state) {
                Some(EntryState::Loaded(EntryValue::Collection(c))) => Arc::clone(c),
                _ => continue,
            };

            let mut members = collection.members.clone();
            let mut delta: i64 = 0;
            let mut touched = false;
            let mut possible = false;
            for object in &objects {
                let present = members.contains(object);
                match batch.read_layer(object).map(|e| &e.state) {
                    Some(EntryState::Loaded(EntryValue::Tombstone)) if present => {
                        members.retain(|m| m != object);
                        delta -= 1;
                    }
                    Some(EntryState::Loaded(EntryValue::Object(snapshot))) => {
                        match where_clause.match_kind(snapshot) {
                            MatchKind::Strict => {
                                touched = true;
                                if !present {
                                    members.push(object.clone());
                                    delta += 1;
                                }
                            }
                            MatchKind::Possible if !present => possible = true,
                            MatchKind::None if present && !batch.is_optimistic() => {
                                members.retain(|m| m != object);
                                delta -= 1;
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            if possible {
                needs_revalidation.push(list.clone());
            }

            if touched && !order_by.is_empty() {
                members = strategy_for(order_by).sort_cache_keys(members, batch);
            }
            if members == collection.members {
                continue;
            }
            let total_count = collection
                .total_count
                .map(|n| (n as i64 + delta).max(0) as u64);
            tracing::trace!(
                cache_key = %list,
                members = members.len(),
                "Updating list from written objects"
            );
            batch.write(
                &list,
                EntryState::Loaded(EntryValue::Collection(Arc::new(CollectionData {
                    members,
                    total_count,
                    next_page_token: collection.next_page_token.clone(),
                }))),
            );
        }
    }
    needs_revalidation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::KeyRegistry;
    use crate::canonical::{OrderByCanonicalizer, WhereClauseCanonicalizer};
    use crate::layer::{LayerTarget, Layers};
    use crate::registry::DependentsIndex;
    use lamina_core::{
        FilterOperator, ObjectSnapshot, OptimisticId, PrimaryKey, PropertyFilter,
    };

    struct Fixture {
        keys: KeyRegistry,
        layers: Layers,
        index: DependentsIndex,
        list: CacheKey,
    }

    fn person(pk: i64, team: &str, name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new("Employee", pk)
            .with_property("team", team)
            .with_property("name", name)
    }

    fn fixture(where_clause: WhereClause) -> Fixture {
        let keys = KeyRegistry::new();
        let wheres = WhereClauseCanonicalizer::new();
        let orders = OrderByCanonicalizer::new();
        let list = keys
            .intern(KeyParams::List {
                object_type: "Employee".to_string(),
                where_clause: wheres.canonicalize(&where_clause).unwrap(),
                order_by: orders.canonicalize(&OrderBy::none().asc("name")).unwrap(),
                pivot: None,
            })
            .unwrap();

        let mut layers = Layers::new();
        let mut index = DependentsIndex::new();
        let existing = keys.object("Employee", &PrimaryKey::from(1)).unwrap();
        layers
            .apply(
                LayerTarget::Base,
                vec![
                    (
                        existing.clone(),
                        Entry::loaded(EntryValue::Object(Arc::new(person(1, "core", "Mia")))),
                    ),
                    (
                        list.clone(),
                        Entry::loaded(EntryValue::Collection(Arc::new(CollectionData {
                            members: vec![existing.clone()],
                            total_count: Some(1),
                            next_page_token: None,
                        }))),
                    ),
                ],
            )
            .unwrap();
        index.set_members(&list, HashSet::from([existing]));
        Fixture {
            keys,
            layers,
            index,
            list,
        }
    }

    fn member_pks(writes: &[(CacheKey, Entry)], list: &CacheKey) -> Option<Vec<PrimaryKey>> {
        writes
            .iter()
            .find(|(k, _)| k == list)
            .and_then(|(_, e)| e.collection())
            .map(|c| {
                c.members
                    .iter()
                    .filter_map(|m| m.primary_key().cloned())
                    .collect()
            })
    }

    #[test]
    fn test_strict_match_is_inserted_in_order() {
        let f = fixture(WhereClause::eq("team", "core"));
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, LayerTarget::Base);
        batch.write_object(person(2, "core", "Ada")).unwrap();
        batch.write_object(person(3, "infra", "Zed")).unwrap();

        assert!(sync_lists_with_writes(&mut batch).is_empty());
        let writes = batch.into_writes();
        assert_eq!(
            member_pks(&writes, &f.list),
            Some(vec![PrimaryKey::from(2), PrimaryKey::from(1)])
        );
        let total = writes
            .iter()
            .find(|(k, _)| *k == f.list)
            .and_then(|(_, e)| e.collection())
            .and_then(|c| c.total_count);
        assert_eq!(total, Some(2));
    }

    #[test]
    fn test_base_write_that_stops_matching_is_removed() {
        let f = fixture(WhereClause::eq("team", "core"));
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, LayerTarget::Base);
        batch.write_object(person(1, "infra", "Mia")).unwrap();

        sync_lists_with_writes(&mut batch);
        assert_eq!(member_pks(&batch.into_writes(), &f.list), Some(vec![]));
    }

    #[test]
    fn test_optimistic_write_never_drops_members() {
        let f = fixture(WhereClause::eq("team", "core"));
        let target = LayerTarget::Optimistic(OptimisticId::new());
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, target);
        batch.write_object(person(1, "infra", "Mia")).unwrap();

        sync_lists_with_writes(&mut batch);
        assert_eq!(member_pks(&batch.into_writes(), &f.list), None);
    }

    #[test]
    fn test_tombstone_is_removed() {
        let f = fixture(WhereClause::all());
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, LayerTarget::Base);
        let key = batch.object_key("Employee", &PrimaryKey::from(1)).unwrap();
        batch.delete(&key);

        sync_lists_with_writes(&mut batch);
        assert_eq!(member_pks(&batch.into_writes(), &f.list), Some(vec![]));
    }

    #[test]
    fn test_server_only_match_requests_revalidation() {
        let f = fixture(WhereClause::property(
            "name",
            PropertyFilter::op(FilterOperator::Regex, "^A"),
        ));
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, LayerTarget::Base);
        batch.write_object(person(2, "core", "Ada")).unwrap();

        assert_eq!(sync_lists_with_writes(&mut batch), vec![f.list.clone()]);
        assert_eq!(member_pks(&batch.into_writes(), &f.list), None);
    }

    #[test]
    fn test_lists_written_in_the_batch_are_left_alone() {
        let f = fixture(WhereClause::all());
        let mut batch = BatchContext::new(&f.layers, &f.keys, &f.index, LayerTarget::Base);
        batch.write(
            &f.list,
            EntryState::Loaded(EntryValue::Collection(Arc::new(CollectionData::default()))),
        );
        batch.write_object(person(2, "core", "Ada")).unwrap();

        sync_lists_with_writes(&mut batch);
        assert_eq!(member_pks(&batch.into_writes(), &f.list), Some(vec![]));
    }

    #[test]
    fn test_auto_fetch_more_policy() {
        assert!(!AutoFetchMore::None.wants_more(0));
        assert!(AutoFetchMore::All.wants_more(1_000));
        assert!(AutoFetchMore::AtLeast(10).wants_more(9));
        assert!(!AutoFetchMore::AtLeast(10).wants_more(10));
    }
}
