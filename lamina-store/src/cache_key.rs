//! Interned cache keys.
//!
//! Every object and every query result lives under a `CacheKey`. Keys are
//! interned per store: equal parameter tuples resolve to one shared key, so
//! maps can be keyed by identity and two subscribers of the same query share
//! one entry and one fetch.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lamina_core::{
    AggregateSpec, CacheError, CacheResult, InvariantError, OrderBy, PivotInfo, PrimaryKey, WhereClause,
};
use tokio::time::Instant;

use crate::canonical::Canonical;

/// The kind tag of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Object,
    List,
    InterfaceList,
    SpecificLink,
    Aggregation,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Object => "object",
            Self::List => "list",
            Self::InterfaceList => "interfaceList",
            Self::SpecificLink => "specificLink",
            Self::Aggregation => "aggregation",
        };
        f.write_str(s)
    }
}

/// Discriminating parameters of a cache key.
///
/// Clause-valued parameters are canonical so structural comparison never
/// sees two differently-shaped spellings of one clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyParams {
    Object {
        object_type: String,
        primary_key: PrimaryKey,
    },
    List {
        object_type: String,
        where_clause: Canonical<WhereClause>,
        order_by: Canonical<OrderBy>,
        pivot: Option<PivotInfo>,
    },
    /// Objects of any type implementing `interface`.
    InterfaceList {
        interface: String,
        where_clause: Canonical<WhereClause>,
        order_by: Canonical<OrderBy>,
    },
    SpecificLink {
        source_type: String,
        primary_key: PrimaryKey,
        link: String,
        where_clause: Canonical<WhereClause>,
        order_by: Canonical<OrderBy>,
    },
    Aggregation {
        object_type: String,
        where_clause: Canonical<WhereClause>,
        aggregate: AggregateSpec,
        pivot: Option<PivotInfo>,
    },
}

impl KeyParams {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Object { .. } => KeyKind::Object,
            Self::List { .. } => KeyKind::List,
            Self::InterfaceList { .. } => KeyKind::InterfaceList,
            Self::SpecificLink { .. } => KeyKind::SpecificLink,
            Self::Aggregation { .. } => KeyKind::Aggregation,
        }
    }
}

#[derive(Debug)]
struct KeyInner {
    id: u64,
    params: KeyParams,
    created_at: Instant,
}

/// Interned cache key. Cheap to clone; compares by identity.
#[derive(Clone)]
pub struct CacheKey(Arc<KeyInner>);

impl CacheKey {
    pub fn kind(&self) -> KeyKind {
        self.0.params.kind()
    }

    pub fn params(&self) -> &KeyParams {
        &self.0.params
    }

    /// Registry-unique sequence number, stable for the key's lifetime.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.0.created_at
    }

    /// Type of the object for object keys, or of the queried set for list
    /// and aggregation keys. For link keys this is the source type and for
    /// interface lists the interface.
    pub fn object_type(&self) -> &str {
        match &self.0.params {
            KeyParams::Object { object_type, .. }
            | KeyParams::List { object_type, .. }
            | KeyParams::Aggregation { object_type, .. } => object_type,
            KeyParams::InterfaceList { interface, .. } => interface,
            KeyParams::SpecificLink { source_type, .. } => source_type,
        }
    }

    /// Whether the entry under this key is a collection of object keys.
    pub fn is_collection(&self) -> bool {
        matches!(
            self.kind(),
            KeyKind::List | KeyKind::InterfaceList | KeyKind::SpecificLink
        )
    }

    /// Primary key for object keys.
    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match &self.0.params {
            KeyParams::Object { primary_key, .. } => Some(primary_key),
            _ => None,
        }
    }

    /// Fail with `KindMismatch` unless this key has the expected kind.
    pub fn expect_kind(&self, expected: KeyKind) -> CacheResult<()> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(self.kind_mismatch(expected))
        }
    }

    pub(crate) fn kind_mismatch(&self, expected: KeyKind) -> CacheError {
        InvariantError::KindMismatch {
            expected: expected.to_string(),
            found: self.kind().to_string(),
        }
        .into()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.params {
            KeyParams::Object {
                object_type,
                primary_key,
            } => write!(f, "object:{}:{}", object_type, primary_key),
            KeyParams::SpecificLink {
                source_type,
                primary_key,
                link,
                ..
            } => write!(f, "specificLink:{}:{}:{}#{}", source_type, primary_key, link, self.0.id),
            params => write!(f, "{}:{}#{}", params.kind(), self.object_type(), self.0.id),
        }
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Interning table for cache keys, owned by one store.
pub struct KeyRegistry {
    next_id: AtomicU64,
    keys: Mutex<HashMap<KeyParams, CacheKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, HashMap<KeyParams, CacheKey>>> {
        self.keys.lock().map_err(|_| InvariantError::LockPoisoned.into())
    }

    /// Return the key for `params`, creating it on first use.
    pub fn intern(&self, params: KeyParams) -> CacheResult<CacheKey> {
        let mut keys = self.lock()?;
        if let Some(existing) = keys.get(&params) {
            return Ok(existing.clone());
        }
        let key = CacheKey(Arc::new(KeyInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            params: params.clone(),
            created_at: Instant::now(),
        }));
        keys.insert(params, key.clone());
        Ok(key)
    }

    /// Interned key for one object.
    pub fn object(&self, object_type: &str, primary_key: &PrimaryKey) -> CacheResult<CacheKey> {
        self.intern(KeyParams::Object {
            object_type: object_type.to_string(),
            primary_key: primary_key.clone(),
        })
    }

    /// Look up an object key without creating it.
    pub fn find_object(&self, object_type: &str, primary_key: &PrimaryKey) -> Option<CacheKey> {
        let params = KeyParams::Object {
            object_type: object_type.to_string(),
            primary_key: primary_key.clone(),
        };
        self.lock().ok()?.get(&params).cloned()
    }

    /// Forget a key. A later `intern` of the same parameters yields a new key.
    pub fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let mut keys = self.lock()?;
        match keys.get(key.params()) {
            Some(current) if current == key => {
                keys.remove(key.params());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Snapshot of every live key.
    pub fn all(&self) -> CacheResult<Vec<CacheKey>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
