//! Optimistic jobs.
//!
//! A job writes speculative creates, updates and deletes into its own
//! optimistic layer in one batch. Creates need type metadata to find the
//! primary key, so a job with creates gathers every creation first and only
//! then writes; one failed creation fails the whole job and nothing is
//! written. Disposing a job removes its layer exactly once.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{self, try_join_all, BoxFuture, FutureExt, Shared};
use lamina_core::{
    CacheError, CacheResult, InvariantError, ObjectSnapshot, OptimisticError, OptimisticId,
    PrimaryKey,
};
use serde_json::{Map, Value};

use crate::batch::BatchOptions;
use crate::store::{Store, StoreInner};

#[derive(Debug, Clone)]
enum Operation {
    Create {
        object_type: String,
        properties: Map<String, Value>,
    },
    Update(ObjectSnapshot),
    Delete {
        object_type: String,
        primary_key: PrimaryKey,
    },
}

impl Operation {
    fn object_type(&self) -> &str {
        match self {
            Self::Create { object_type, .. } | Self::Delete { object_type, .. } => object_type,
            Self::Update(snapshot) => &snapshot.object_type,
        }
    }
}

/// Collects the operations of one optimistic job.
#[derive(Debug, Default)]
pub struct OptimisticBuilder {
    operations: Vec<Operation>,
}

impl OptimisticBuilder {
    /// Create an object. Its primary key is read from `properties` using the
    /// type's primary key field.
    pub fn create_object(
        &mut self,
        object_type: impl Into<String>,
        properties: Map<String, Value>,
    ) -> &mut Self {
        self.operations.push(Operation::Create {
            object_type: object_type.into(),
            properties,
        });
        self
    }

    /// Replace an object's cached snapshot.
    pub fn update_object(&mut self, snapshot: ObjectSnapshot) -> &mut Self {
        self.operations.push(Operation::Update(snapshot));
        self
    }

    /// Hide an object until the job's layer is removed.
    pub fn delete_object(
        &mut self,
        object_type: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
    ) -> &mut Self {
        self.operations.push(Operation::Delete {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
        });
        self
    }

    fn has_creates(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Create { .. }))
    }

    fn object_types(&self) -> Vec<String> {
        self.operations
            .iter()
            .map(|op| op.object_type().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

type Applied = Shared<BoxFuture<'static, CacheResult<()>>>;

/// A running optimistic job.
///
/// Dropping the handle does not remove the layer; call [`dispose`].
///
/// [`dispose`]: OptimisticJob::dispose
pub struct OptimisticJob {
    id: OptimisticId,
    applied: Applied,
    disposed: Arc<AtomicBool>,
    store: Weak<StoreInner>,
    object_types: Vec<String>,
}

impl OptimisticJob {
    pub fn id(&self) -> OptimisticId {
        self.id
    }

    /// Object types the job touches.
    pub fn object_types(&self) -> &[String] {
        &self.object_types
    }

    /// Wait until the layer has been written, or the job has failed.
    pub async fn applied(&self) -> CacheResult<()> {
        self.applied.clone().await
    }

    /// Remove the job's layer. Waits for pending creations first so the
    /// write can never land after removal. Safe to call more than once.
    pub async fn dispose(&self) -> CacheResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.applied.clone().await {
            tracing::debug!(optimistic_id = %self.id, error = %e, "Disposing failed job");
        }
        match self.store.upgrade() {
            Some(store) => {
                store.remove_layer(self.id)?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Store {
    /// Start an optimistic job.
    ///
    /// Without creates the layer is written before this returns. With
    /// creates the metadata lookups run first and the single layer write
    /// follows; await [`OptimisticJob::applied`] to observe the outcome.
    pub fn run_optimistic_job<B>(&self, build: B) -> OptimisticJob
    where
        B: FnOnce(&mut OptimisticBuilder),
    {
        let id = OptimisticId::new();
        let mut builder = OptimisticBuilder::default();
        build(&mut builder);
        let object_types = builder.object_types();
        tracing::debug!(
            optimistic_id = %id,
            operations = builder.operations.len(),
            "Starting optimistic job"
        );

        let applied: Applied = if builder.has_creates() {
            let store = Arc::downgrade(&self.inner);
            let applied = apply_with_creates(store, id, builder.operations)
                .boxed()
                .shared();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(applied.clone().map(|_| ()));
            }
            applied
        } else {
            let result = write_layer(&self.inner, id, builder.operations);
            future::ready(result).boxed().shared()
        };

        OptimisticJob {
            id,
            applied,
            disposed: Arc::new(AtomicBool::new(false)),
            store: Arc::downgrade(&self.inner),
            object_types,
        }
    }

    /// Show `build`'s changes optimistically while `write` performs the real
    /// mutation.
    ///
    /// The optimistic layer is always removed afterwards, and every object
    /// type the job touched is invalidated so the confirmed state is
    /// refetched. Returns whatever `write` returned.
    pub async fn apply_with_optimistic<B, W, T>(&self, build: B, write: W) -> CacheResult<T>
    where
        B: FnOnce(&mut OptimisticBuilder),
        W: Future<Output = CacheResult<T>>,
    {
        let job = self.run_optimistic_job(build);
        if let Err(e) = job.applied().await {
            tracing::error!(optimistic_id = %job.id(), error = %e, "Optimistic update failed");
        }
        let result = write.await;
        job.dispose().await?;
        for object_type in job.object_types() {
            self.invalidate_object_type(object_type).await;
        }
        result
    }
}

async fn apply_with_creates(
    store: Weak<StoreInner>,
    id: OptimisticId,
    operations: Vec<Operation>,
) -> CacheResult<()> {
    let inner = store.upgrade().ok_or_else(|| {
        CacheError::from(InvariantError::StoreDropped {
            operation: format!("optimistic job {}", id),
        })
    })?;

    let resolved = try_join_all(operations.into_iter().map(|op| {
        let inner = Arc::clone(&inner);
        async move {
            match op {
                Operation::Create {
                    object_type,
                    properties,
                } => create_snapshot(&inner, id, object_type, properties)
                    .await
                    .map(Operation::Update),
                other => Ok(other),
            }
        }
    }))
    .await?;

    write_layer(&inner, id, resolved)
}

async fn create_snapshot(
    store: &StoreInner,
    id: OptimisticId,
    object_type: String,
    properties: Map<String, Value>,
) -> CacheResult<ObjectSnapshot> {
    let failed = |reason: String| -> CacheError {
        OptimisticError::CreationFailed {
            optimistic_id: id,
            object_type: object_type.clone(),
            reason,
        }
        .into()
    };
    let metadata = store
        .metadata
        .get(&object_type)
        .await
        .map_err(|e| failed(e.to_string()))?;
    let primary_key = properties
        .get(&metadata.primary_key_field)
        .and_then(PrimaryKey::from_value)
        .ok_or_else(|| {
            failed(format!(
                "missing primary key field `{}`",
                metadata.primary_key_field
            ))
        })?;
    Ok(ObjectSnapshot {
        object_type: object_type.clone(),
        primary_key,
        properties,
    })
}

fn write_layer(store: &StoreInner, id: OptimisticId, operations: Vec<Operation>) -> CacheResult<()> {
    let outcome = store.batch(BatchOptions::optimistic(id), |batch| {
        for op in operations {
            match op {
                Operation::Update(snapshot) => {
                    batch.write_object(snapshot)?;
                }
                Operation::Delete {
                    object_type,
                    primary_key,
                } => {
                    let key = batch.object_key(&object_type, &primary_key)?;
                    batch.delete(&key);
                }
                Operation::Create { object_type, .. } => {
                    return Err(OptimisticError::CreationFailed {
                        optimistic_id: id,
                        object_type,
                        reason: "creation was not resolved before writing".to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    });
    match outcome {
        Ok(outcome) => {
            tracing::debug!(
                optimistic_id = %id,
                changed = outcome.changes.len(),
                "Applied optimistic layer"
            );
            Ok(())
        }
        Err(CacheError::Invariant(e)) => Err(OptimisticError::WriteFailed {
            optimistic_id: id,
            reason: e.to_string(),
        }
        .into()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{
        AggregateRequest, LinkRequest, MetadataProvider, ObjectFetcher, Page, PageRequest,
    };
    use async_trait::async_trait;
    use lamina_core::{AggregationResult, FetchError, ObjectMetadata, StoreConfig};
    use serde_json::json;

    struct Quiet;

    #[async_trait]
    impl ObjectFetcher for Quiet {
        async fn fetch_page(&self, _request: PageRequest) -> Result<Page, FetchError> {
            Ok(Page::default())
        }

        async fn fetch_one(
            &self,
            object_type: &str,
            primary_key: &PrimaryKey,
        ) -> Result<ObjectSnapshot, FetchError> {
            Err(FetchError::not_found(object_type, primary_key.clone()))
        }

        async fn fetch_linked(&self, _request: LinkRequest) -> Result<Page, FetchError> {
            Ok(Page::default())
        }

        async fn aggregate(
            &self,
            _request: AggregateRequest,
        ) -> Result<AggregationResult, FetchError> {
            Ok(AggregationResult::default())
        }
    }

    #[async_trait]
    impl MetadataProvider for Quiet {
        async fn fetch_metadata(&self, object_type: &str) -> Result<ObjectMetadata, FetchError> {
            match object_type {
                "Ghost" => Err(FetchError::Metadata {
                    object_type: object_type.to_string(),
                    reason: "unknown type".to_string(),
                }),
                _ => Ok(ObjectMetadata::new(object_type, "id")),
            }
        }
    }

    fn store() -> Store {
        Store::new(Arc::new(Quiet), Arc::new(Quiet), StoreConfig::default()).unwrap()
    }

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_update_is_written_synchronously() {
        let store = store();
        let job = store.run_optimistic_job(|b| {
            b.update_object(ObjectSnapshot::new("Employee", 1).with_property("name", "Ada"));
        });
        let key = store.object_key("Employee", &PrimaryKey::from(1)).unwrap();
        assert_eq!(store.optimistic_layer_keys(job.id()).unwrap(), vec![key]);
        job.applied().await.unwrap();

        job.dispose().await.unwrap();
        job.dispose().await.unwrap();
        assert!(store.optimistic_layer_keys(job.id()).unwrap().is_empty());
        assert!(store.read_object("Employee", &PrimaryKey::from(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_reads_primary_key_from_metadata() {
        let store = store();
        let job = store.run_optimistic_job(|b| {
            b.create_object("Employee", props(json!({"id": 9, "name": "New"})));
        });
        job.applied().await.unwrap();
        let created = store.read_object("Employee", &PrimaryKey::from(9)).unwrap().unwrap();
        assert_eq!(created.property("name"), Some(&json!("New")));
        job.dispose().await.unwrap();
        assert!(store.read_object("Employee", &PrimaryKey::from(9)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_creation_writes_nothing() {
        let store = store();
        let job = store.run_optimistic_job(|b| {
            b.update_object(ObjectSnapshot::new("Employee", 1));
            b.create_object("Ghost", props(json!({"id": 1})));
        });
        let err = job.applied().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Optimistic(OptimisticError::CreationFailed { ref object_type, .. })
                if object_type == "Ghost"
        ));
        assert!(store.optimistic_layer_keys(job.id()).unwrap().is_empty());
        job.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_primary_key_fails_creation() {
        let store = store();
        let job = store.run_optimistic_job(|b| {
            b.create_object("Employee", props(json!({"name": "No id"})));
        });
        assert!(job.applied().await.is_err());
        job.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_hides_until_disposed() {
        let store = store();
        store
            .batch(BatchOptions::base(), |b| {
                b.write_object(ObjectSnapshot::new("Employee", 3))
            })
            .unwrap();
        let job = store.run_optimistic_job(|b| {
            b.delete_object("Employee", 3);
        });
        assert!(store.read_object("Employee", &PrimaryKey::from(3)).unwrap().is_none());
        job.dispose().await.unwrap();
        assert!(store.read_object("Employee", &PrimaryKey::from(3)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_with_optimistic_always_disposes() {
        let store = store();
        let result: CacheResult<()> = store
            .apply_with_optimistic(
                |b| {
                    b.update_object(ObjectSnapshot::new("Employee", 5));
                },
                async { Err::<(), CacheError>(FetchError::transient("server said no").into()) },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.stats().unwrap().optimistic_layers, 0);
        assert!(store.read_object("Employee", &PrimaryKey::from(5)).unwrap().is_none());
    }
}
