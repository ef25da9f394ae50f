//! Lists over an interface.
//!
//! An interface page can mix object types and may carry only the
//! interface's properties, so every fetched member is reloaded in full
//! through the bulk loader before it is written. Members are then cached
//! under their concrete object keys like any other list.
//!
//! Written objects are never folded into interface lists locally: whether
//! a concrete type implements the interface is metadata the batch does not
//! have. Invalidating an implementing type refetches the list instead.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use lamina_core::{CacheResult, FetchError, ObjectSnapshot, OrderBy, WhereClause};

use super::list::{AutoFetchMore, PageSource, Paging};
use super::QueryCore;
use crate::cache_key::{CacheKey, KeyKind, KeyParams};
use crate::canonical::Canonical;
use crate::fetcher::{Page, PageRequest, TypeKind};
use crate::store::StoreInner;

/// Parameters of an interface list query.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceListOptions {
    pub interface: String,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
}

impl InterfaceListOptions {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            where_clause: WhereClause::all(),
            order_by: OrderBy::none(),
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

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_auto_fetch_more(mut self, auto_fetch_more: AutoFetchMore) -> Self {
        self.auto_fetch_more = auto_fetch_more;
        self
    }
}

/// Query for every object, of any type, implementing an interface and
/// matching a clause.
pub struct InterfaceListQuery {
    pub(crate) core: QueryCore,
    interface: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    paging: Paging,
}

impl InterfaceListQuery {
    pub(crate) fn new(
        key: CacheKey,
        store: Weak<StoreInner>,
        page_size: Option<u32>,
        auto_fetch_more: AutoFetchMore,
    ) -> CacheResult<Self> {
        let KeyParams::InterfaceList {
            interface,
            where_clause,
            order_by,
        } = key.params()
        else {
            return Err(key.kind_mismatch(KeyKind::InterfaceList));
        };
        Ok(Self {
            interface: interface.clone(),
            where_clause: where_clause.clone(),
            order_by: order_by.clone(),
            paging: Paging::new(page_size, auto_fetch_more, order_by),
            core: QueryCore::new(key, store),
        })
    }

    pub fn key(&self) -> &CacheKey {
        self.core.key()
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn where_clause(&self) -> &Canonical<WhereClause> {
        &self.where_clause
    }

    pub fn order_by(&self) -> &Canonical<OrderBy> {
        &self.order_by
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.core.is_busy() || self.paging.is_busy()
    }

    /// Reload from the first page. Concurrent calls share one fetch.
    pub async fn revalidate(self: &Arc<Self>, force: bool) -> CacheResult<()> {
        let this = Arc::clone(self);
        self.core
            .revalidate(force, move || async move {
                let store = this.core.store()?;
                this.paging.load(&this.core, &*this, &store).await
            })
            .await
    }

    /// Append the next page. Waits for an in-flight revalidation first.
    pub async fn fetch_more(self: &Arc<Self>) -> CacheResult<()> {
        self.paging.fetch_more(&self.core, Arc::clone(self)).await
    }

    /// Revalidate when `object_type` is the interface itself or a type
    /// whose metadata says it implements the interface.
    pub async fn invalidate_object_type(self: &Arc<Self>, object_type: &str) -> CacheResult<bool> {
        if object_type != self.interface {
            let store = self.core.store()?;
            if !store.metadata.get(object_type).await?.implements(&self.interface) {
                return Ok(false);
            }
        }
        self.revalidate(true).await?;
        Ok(true)
    }
}

/// Replace each interface view with the full object, keeping page order.
async fn reload_full_objects(
    store: &StoreInner,
    views: Vec<ObjectSnapshot>,
) -> Result<Vec<ObjectSnapshot>, FetchError> {
    try_join_all(
        views
            .into_iter()
            .map(|view| async move { store.loader.fetch(&view.object_type, view.primary_key).await }),
    )
    .await
}

#[async_trait]
impl PageSource for InterfaceListQuery {
    async fn fetch_page(
        &self,
        store: &StoreInner,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<Page, FetchError> {
        let page = store
            .fetcher
            .fetch_page(PageRequest {
                object_type: self.interface.clone(),
                type_kind: TypeKind::Interface,
                where_clause: (*self.where_clause).clone(),
                order_by: (*self.order_by).clone(),
                pivot: None,
                page_size,
                page_token,
            })
            .await?;
        tracing::trace!(
            interface = %self.interface,
            objects = page.data.len(),
            "Reloading interface page as full objects"
        );
        Ok(Page {
            data: reload_full_objects(store, page.data).await?,
            ..page
        })
    }
}

impl AsRef<QueryCore> for InterfaceListQuery {
    fn as_ref(&self) -> &QueryCore {
        &self.core
    }
}

impl AsRef<Paging> for InterfaceListQuery {
    fn as_ref(&self) -> &Paging {
        &self.paging
    }
}
