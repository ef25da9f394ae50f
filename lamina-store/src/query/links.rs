//! Queries for the objects linked from one source object.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lamina_core::{CacheResult, FetchError, OrderBy, PrimaryKey, WhereClause};

use super::invalidation::traversal_types;
use super::list::{AutoFetchMore, PageSource, Paging};
use super::QueryCore;
use crate::cache_key::{CacheKey, KeyKind, KeyParams};
use crate::canonical::Canonical;
use crate::fetcher::{LinkRequest, Page};
use crate::store::StoreInner;

/// Parameters of a link query.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub source_type: String,
    pub primary_key: PrimaryKey,
    pub link: String,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
}

impl LinkOptions {
    pub fn new(
        source_type: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
        link: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            primary_key: primary_key.into(),
            link: link.into(),
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

/// Query for the objects one source object links to.
pub struct LinkQuery {
    pub(crate) core: QueryCore,
    source_type: String,
    primary_key: PrimaryKey,
    link: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    paging: Paging,
}

impl LinkQuery {
    pub(crate) fn new(
        key: CacheKey,
        store: Weak<StoreInner>,
        page_size: Option<u32>,
        auto_fetch_more: AutoFetchMore,
    ) -> CacheResult<Self> {
        let KeyParams::SpecificLink {
            source_type,
            primary_key,
            link,
            where_clause,
            order_by,
        } = key.params()
        else {
            return Err(key.kind_mismatch(KeyKind::SpecificLink));
        };
        Ok(Self {
            source_type: source_type.clone(),
            primary_key: primary_key.clone(),
            link: link.clone(),
            where_clause: where_clause.clone(),
            order_by: order_by.clone(),
            paging: Paging::new(page_size, auto_fetch_more, order_by),
            core: QueryCore::new(key, store),
        })
    }

    pub fn key(&self) -> &CacheKey {
        self.core.key()
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn link(&self) -> &str {
        &self.link
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

    /// The source type and the link's target type.
    pub async fn ensure_invalidation_types_ready(&self) -> CacheResult<&HashSet<String>> {
        self.core
            .invalidation_types(|| self.resolve_invalidation_types())
            .await
    }

    async fn resolve_invalidation_types(&self) -> CacheResult<HashSet<String>> {
        let store = self.core.store()?;
        let links = [self.link.clone()];
        Ok(traversal_types(&store.metadata, &self.source_type, &links).await?)
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
impl PageSource for LinkQuery {
    async fn fetch_page(
        &self,
        store: &StoreInner,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<Page, FetchError> {
        store
            .fetcher
            .fetch_linked(LinkRequest {
                source_type: self.source_type.clone(),
                primary_key: self.primary_key.clone(),
                link: self.link.clone(),
                where_clause: (*self.where_clause).clone(),
                order_by: (*self.order_by).clone(),
                page_size,
                page_token,
            })
            .await
    }
}

impl AsRef<QueryCore> for LinkQuery {
    fn as_ref(&self) -> &QueryCore {
        &self.core
    }
}

impl AsRef<Paging> for LinkQuery {
    fn as_ref(&self) -> &Paging {
        &self.paging
    }
}
