//! Micro-batched loading of single objects.
//!
//! Requests for objects of one type that arrive within the debounce window
//! are sent as one `pk in [...]` page request. A batch also goes out as soon
//! as it reaches the size threshold, which cancels its timer. Each caller
//! gets its own result: a key missing from the response fails only the
//! callers waiting on that key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lamina_core::{
    FetchError, FilterOperator, ObjectSnapshot, PrimaryKey, PropertyFilter, StoreConfig,
    WhereClause,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::fetcher::{MetadataCache, ObjectFetcher, PageRequest};

type Waiter = oneshot::Sender<Result<ObjectSnapshot, FetchError>>;

struct PendingBatch {
    generation: u64,
    keys: Vec<PrimaryKey>,
    waiters: HashMap<PrimaryKey, Vec<Waiter>>,
    timer: Option<JoinHandle<()>>,
}

struct LoaderInner {
    fetcher: Arc<dyn ObjectFetcher>,
    metadata: Arc<MetadataCache>,
    window: Duration,
    max_batch: usize,
    pending: Mutex<HashMap<String, PendingBatch>>,
    next_generation: AtomicU64,
    batches_issued: AtomicU64,
}

/// Coalesces single-object fetches per type.
#[derive(Clone)]
pub struct BulkLoader {
    inner: Arc<LoaderInner>,
}

impl BulkLoader {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        metadata: Arc<MetadataCache>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetcher,
                metadata,
                window: config.bulk_load_window,
                max_batch: config.bulk_load_max_batch.max(1),
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                batches_issued: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch one object, sharing a network call with concurrent requests.
    pub async fn fetch(
        &self,
        object_type: &str,
        primary_key: PrimaryKey,
    ) -> Result<ObjectSnapshot, FetchError> {
        let receiver = self.enqueue(object_type, primary_key.clone());
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::transient(format!(
                "bulk load of {} {} was dropped",
                object_type, primary_key
            ))),
        }
    }

    /// Number of batched requests sent so far.
    pub fn batches_issued(&self) -> u64 {
        self.inner.batches_issued.load(Ordering::Relaxed)
    }

    fn enqueue(
        &self,
        object_type: &str,
        primary_key: PrimaryKey,
    ) -> oneshot::Receiver<Result<ObjectSnapshot, FetchError>> {
        let (sender, receiver) = oneshot::channel();
        let mut pending = self.inner.lock();

        let batch = pending.entry(object_type.to_string()).or_insert_with(|| {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            PendingBatch {
                generation,
                keys: Vec::new(),
                waiters: HashMap::new(),
                timer: None,
            }
        });

        let waiters = batch.waiters.entry(primary_key.clone()).or_default();
        if waiters.is_empty() {
            batch.keys.push(primary_key);
        }
        waiters.push(sender);

        if batch.keys.len() >= self.inner.max_batch {
            if let Some(batch) = pending.remove(object_type) {
                drop(pending);
                self.dispatch(object_type.to_string(), batch);
            }
        } else if batch.timer.is_none() {
            let loader = self.clone();
            let generation = batch.generation;
            let object_type = object_type.to_string();
            let window = self.inner.window;
            batch.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                loader.flush_timed_out(&object_type, generation);
            }));
        }
        receiver
    }

    fn flush_timed_out(&self, object_type: &str, generation: u64) {
        let mut pending = self.inner.lock();
        let due = matches!(pending.get(object_type), Some(b) if b.generation == generation);
        if due {
            if let Some(mut batch) = pending.remove(object_type) {
                drop(pending);
                // This task is the timer; don't abort ourselves.
                batch.timer = None;
                self.dispatch(object_type.to_string(), batch);
            }
        }
    }

    fn dispatch(&self, object_type: String, mut batch: PendingBatch) {
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        self.inner.batches_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            object_type = %object_type,
            keys = batch.keys.len(),
            "Dispatching bulk load"
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.load(&object_type, &batch.keys).await;
            resolve_waiters(&object_type, batch.waiters, result);
        });
    }
}

impl LoaderInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingBatch>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load(
        &self,
        object_type: &str,
        keys: &[PrimaryKey],
    ) -> Result<HashMap<PrimaryKey, ObjectSnapshot>, FetchError> {
        if let [only] = keys {
            return match self.fetcher.fetch_one(object_type, only).await {
                Ok(object) => Ok(HashMap::from([(only.clone(), object)])),
                Err(e) if e.is_not_found() => Ok(HashMap::new()),
                Err(e) => Err(e),
            };
        }

        let metadata = self.metadata.get(object_type).await?;
        let values: Vec<Value> = keys.iter().map(PrimaryKey::to_value).collect();
        let mut request = PageRequest::new(
            object_type,
            WhereClause::property(
                metadata.primary_key_field.clone(),
                PropertyFilter::op(FilterOperator::In, Value::Array(values)),
            ),
        );
        request.page_size = u32::try_from(keys.len()).ok();

        let mut found = HashMap::with_capacity(keys.len());
        loop {
            let page = self.fetcher.fetch_page(request.clone()).await?;
            for object in page.data {
                found.insert(object.primary_key.clone(), object);
            }
            match page.next_page_token {
                Some(token) if found.len() < keys.len() => request.page_token = Some(token),
                _ => break,
            }
        }
        Ok(found)
    }
}

fn resolve_waiters(
    object_type: &str,
    waiters: HashMap<PrimaryKey, Vec<Waiter>>,
    result: Result<HashMap<PrimaryKey, ObjectSnapshot>, FetchError>,
) {
    match result {
        Ok(mut found) => {
            for (primary_key, senders) in waiters {
                let outcome = found
                    .remove(&primary_key)
                    .ok_or_else(|| FetchError::not_found(object_type, primary_key.clone()));
                for sender in senders {
                    let _ = sender.send(outcome.clone());
                }
            }
        }
        Err(e) => {
            tracing::debug!(object_type, error = %e, "Bulk load failed");
            for sender in waiters.into_values().flatten() {
                let _ = sender.send(Err(e.clone()));
            }
        }
    }
}
