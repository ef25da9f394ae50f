//! LAMINA Store - Normalized Object Cache
//!
//! Client-side cache for objects fetched from a remote data service.
//! Every query result is stored under an interned [`CacheKey`]; lists hold
//! object keys rather than copies, so one write to an object is seen by
//! every list, link set and observer that references it.
//!
//! Writes go through [`Store::batch`], either into the confirmed base layer
//! or into an optimistic layer that shadows it until removed.

pub mod batch;
pub mod bulk_loader;
pub mod cache_key;
pub mod canonical;
pub mod changes;
pub mod fetcher;
pub mod layer;
pub mod observe;
pub mod optimistic;
pub mod query;
pub mod refcount;
pub mod registry;
pub mod sorting;
pub mod store;
pub mod subject;

pub use batch::{BatchContext, BatchOptions, BatchOutcome};
pub use bulk_loader::BulkLoader;
pub use cache_key::{CacheKey, KeyKind, KeyParams};
pub use canonical::Canonical;
pub use changes::Changes;
pub use fetcher::{
    AggregateRequest, LinkRequest, MetadataCache, MetadataProvider, ObjectFetcher, Page,
    PageRequest, TypeKind,
};
pub use layer::{CollectionData, Entry, EntryState, EntryValue, LayerTarget};
pub use observe::{
    AggregationPayload, ListPayload, ObjectPayload, Observer, Payload, Subscription,
};
pub use optimistic::{OptimisticBuilder, OptimisticJob};
pub use query::{
    AggregationOptions, AggregationQuery, AutoFetchMore, InterfaceListOptions, InterfaceListQuery,
    LinkOptions, LinkQuery, ListOptions, ListQuery, ObjectQuery,
};
pub use sorting::{NoOpSortingStrategy, OrderBySortingStrategy, SortingStrategy};
pub use store::{Store, StoreStats};

pub use lamina_core::{
    AggregateMetric, AggregateSpec, AggregationResult, CacheError, CacheResult, FetchError,
    ObjectMetadata, ObjectSnapshot, OptimisticId, OrderBy, PivotInfo, PrimaryKey, Status,
    StoreConfig, WhereClause,
};
