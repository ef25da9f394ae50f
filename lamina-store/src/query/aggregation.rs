//! Aggregation queries.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use lamina_core::{AggregateSpec, CacheResult, PivotInfo, WhereClause};

use super::invalidation::traversal_types;
use super::QueryCore;
use crate::batch::BatchOptions;
use crate::cache_key::{CacheKey, KeyKind, KeyParams};
use crate::canonical::Canonical;
use crate::fetcher::AggregateRequest;
use crate::layer::{EntryState, EntryValue};
use crate::store::StoreInner;

/// Parameters of an aggregation query.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOptions {
    pub object_type: String,
    pub where_clause: WhereClause,
    pub aggregate: AggregateSpec,
    pub pivot: Option<PivotInfo>,
}

impl AggregationOptions {
    pub fn new(object_type: impl Into<String>, aggregate: AggregateSpec) -> Self {
        Self {
            object_type: object_type.into(),
            where_clause: WhereClause::all(),
            aggregate,
            pivot: None,
        }
    }

    pub fn with_where(mut self, where_clause: WhereClause) -> Self {
        self.where_clause = where_clause;
        self
    }

    pub fn with_pivot(mut self, pivot: PivotInfo) -> Self {
        self.pivot = Some(pivot);
        self
    }
}

/// Query for metrics over the objects matching a clause.
pub struct AggregationQuery {
    pub(crate) core: QueryCore,
    object_type: String,
    where_clause: Canonical<WhereClause>,
    aggregate: AggregateSpec,
    pivot: Option<PivotInfo>,
}

impl AggregationQuery {
    pub(crate) fn new(key: CacheKey, store: Weak<StoreInner>) -> CacheResult<Self> {
        let KeyParams::Aggregation {
            object_type,
            where_clause,
            aggregate,
            pivot,
        } = key.params()
        else {
            return Err(key.kind_mismatch(KeyKind::Aggregation));
        };
        Ok(Self {
            object_type: object_type.clone(),
            where_clause: where_clause.clone(),
            aggregate: aggregate.clone(),
            pivot: pivot.clone(),
            core: QueryCore::new(key, store),
        })
    }

    pub fn key(&self) -> &CacheKey {
        self.core.key()
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn aggregate(&self) -> &AggregateSpec {
        &self.aggregate
    }

    pub async fn revalidate(self: &Arc<Self>, force: bool) -> CacheResult<()> {
        let this = Arc::clone(self);
        self.core
            .revalidate(force, move || async move { this.fetch_and_store().await })
            .await
    }

    async fn fetch_and_store(&self) -> CacheResult<()> {
        let store = self.core.store()?;
        self.core.mark_loading(&store)?;

        tracing::debug!(cache_key = %self.key(), "Revalidating aggregation");
        let request = AggregateRequest {
            object_type: self.object_type.clone(),
            where_clause: (*self.where_clause).clone(),
            pivot: self.pivot.clone(),
            aggregate: self.aggregate.clone(),
        };
        match store.fetcher.aggregate(request).await {
            Ok(result) => {
                let key = self.key().clone();
                store.batch(BatchOptions::base(), move |batch| {
                    batch.write(
                        &key,
                        EntryState::Loaded(EntryValue::Aggregation(Arc::new(result))),
                    );
                    Ok(())
                })?;
                Ok(())
            }
            Err(e) => self.core.write_error(&store, e),
        }
    }

    /// The aggregated type and every type a pivot passes through.
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
