//! Collaborator traits for the backing data service.
//!
//! The store never talks to the network itself. It asks an `ObjectFetcher`
//! for objects, pages and aggregations and a `MetadataProvider` for type
//! metadata. Both are assumed idempotent and retryable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lamina_core::{
    AggregateSpec, AggregationResult, FetchError, ObjectMetadata, ObjectSnapshot, OrderBy,
    PivotInfo, PrimaryKey, WhereClause,
};
use tokio::sync::OnceCell;

// ============================================================================
// REQUESTS
// ============================================================================

/// Whether a page request names an object type or an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypeKind {
    #[default]
    Object,
    /// Every object type implementing the interface. Objects in such a page
    /// may carry only the interface's properties.
    Interface,
}

/// Request for one page of objects matching a clause.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// Type the clause applies to. With a pivot this is the source type.
    pub object_type: String,
    pub type_kind: TypeKind,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    /// Links to traverse from the matching objects before returning.
    pub pivot: Option<PivotInfo>,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
}

impl PageRequest {
    pub fn new(object_type: impl Into<String>, where_clause: WhereClause) -> Self {
        Self {
            object_type: object_type.into(),
            type_kind: TypeKind::Object,
            where_clause,
            order_by: OrderBy::none(),
            pivot: None,
            page_size: None,
            page_token: None,
        }
    }
}

/// Request for objects linked from one source object.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub source_type: String,
    pub primary_key: PrimaryKey,
    pub link: String,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
}

/// Request for an aggregation over a clause.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub object_type: String,
    pub where_clause: WhereClause,
    pub pivot: Option<PivotInfo>,
    pub aggregate: AggregateSpec,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub data: Vec<ObjectSnapshot>,
    pub next_page_token: Option<String>,
    pub total_count: Option<u64>,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Fetches objects from the backing data service.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Fetch one page of objects matching a clause.
    async fn fetch_page(&self, request: PageRequest) -> Result<Page, FetchError>;

    /// Fetch a single object by primary key.
    async fn fetch_one(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> Result<ObjectSnapshot, FetchError>;

    /// Fetch one page of objects linked from a source object.
    async fn fetch_linked(&self, request: LinkRequest) -> Result<Page, FetchError>;

    /// Compute an aggregation.
    async fn aggregate(&self, request: AggregateRequest) -> Result<AggregationResult, FetchError>;
}

/// Supplies type metadata.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch_metadata(&self, object_type: &str) -> Result<ObjectMetadata, FetchError>;
}

// ============================================================================
// METADATA CACHE
// ============================================================================

/// Memoizes metadata per type.
///
/// Concurrent lookups of the same type share one provider call. Failures
/// are not cached, so the next lookup tries again.
pub struct MetadataCache {
    provider: Arc<dyn MetadataProvider>,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<ObjectMetadata>>>>>,
}

impl MetadataCache {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, object_type: &str) -> Result<Arc<ObjectMetadata>, FetchError> {
        let cell = {
            let mut cells = self
                .cells
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(cells.entry(object_type.to_string()).or_default())
        };
        let metadata = cell
            .get_or_try_init(|| async {
                tracing::debug!(object_type, "Fetching object metadata");
                self.provider.fetch_metadata(object_type).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(metadata))
    }

    /// Number of types with resolved metadata.
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .map(|cells| cells.values().filter(|c| c.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
