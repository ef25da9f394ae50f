//! Single-object queries.

use std::sync::{Arc, Weak};

use lamina_core::{CacheResult, PrimaryKey};

use super::QueryCore;
use crate::batch::BatchOptions;
use crate::cache_key::{CacheKey, KeyKind, KeyParams};
use crate::store::StoreInner;

/// Query for one object by type and primary key.
///
/// Fetches go through the bulk loader so many object queries started
/// together share one request.
pub struct ObjectQuery {
    pub(crate) core: QueryCore,
    object_type: String,
    primary_key: PrimaryKey,
}

impl ObjectQuery {
    pub(crate) fn new(key: CacheKey, store: Weak<StoreInner>) -> CacheResult<Self> {
        let (object_type, primary_key) = match key.params() {
            KeyParams::Object {
                object_type,
                primary_key,
            } => (object_type.clone(), primary_key.clone()),
            _ => return Err(key.kind_mismatch(KeyKind::Object)),
        };
        Ok(Self {
            core: QueryCore::new(key, store),
            object_type,
            primary_key,
        })
    }

    pub fn key(&self) -> &CacheKey {
        self.core.key()
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// Refetch the object. Concurrent calls share one fetch.
    pub async fn revalidate(self: &Arc<Self>, force: bool) -> CacheResult<()> {
        let this = Arc::clone(self);
        self.core
            .revalidate(force, move || async move { this.fetch_and_store().await })
            .await
    }

    async fn fetch_and_store(&self) -> CacheResult<()> {
        let store = self.core.store()?;
        self.core.mark_loading(&store)?;

        tracing::debug!(cache_key = %self.key(), "Revalidating object");
        match store
            .loader
            .fetch(&self.object_type, self.primary_key.clone())
            .await
        {
            Ok(object) => {
                let key = self.key().clone();
                store.batch(BatchOptions::base(), move |batch| {
                    if batch.write_object(object)? != key {
                        tracing::warn!(cache_key = %key, "Fetched object landed under a different key");
                    }
                    Ok(())
                })?;
                Ok(())
            }
            Err(e) => self.core.write_error(&store, e),
        }
    }

    /// Object queries depend only on their own type.
    pub async fn invalidate_object_type(self: &Arc<Self>, object_type: &str) -> CacheResult<bool> {
        if object_type != self.object_type {
            return Ok(false);
        }
        self.revalidate(true).await?;
        Ok(true)
    }
}
