//! LAMINA Core - Data Types
//!
//! Plain data shared by the store and its collaborators: object snapshots,
//! where/order clauses, type metadata, status and errors.
//! This crate contains no cache logic.

pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod metadata;
pub mod object;
pub mod order_by;
pub mod status;

pub use config::StoreConfig;
pub use error::{CacheError, CacheResult, ConfigError, FetchError, InvariantError, OptimisticError};
pub use filter::{compare_values, FilterOperator, MatchKind, PropertyFilter, WhereClause};
pub use identity::{OptimisticId, Timestamp};
pub use metadata::{
    AggregateMetric, AggregateSpec, AggregationBucket, AggregationResult, LinkMetadata,
    ObjectMetadata, PivotInfo,
};
pub use object::{ObjectSnapshot, PrimaryKey};
pub use order_by::{OrderBy, OrderTerm, SortDirection};
pub use status::Status;
