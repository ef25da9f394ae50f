//! Object snapshots and primary keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Primary key of a cached object.
///
/// Only integer and string keys are supported; both hash and order
/// deterministically so they can participate in interned cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
}

impl PrimaryKey {
    /// Convert to a JSON value, e.g. for building `pk in [...]` filters.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(i) => Value::from(*i),
            Self::String(s) => Value::from(s.clone()),
        }
    }

    /// Read a primary key back out of a JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Integer),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A snapshot of one object as returned by the backing data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// API name of the object type.
    pub object_type: String,
    /// Primary key value.
    pub primary_key: PrimaryKey,
    /// Property values keyed by property API name.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ObjectSnapshot {
    /// Create a snapshot without any properties.
    pub fn new(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
            properties: Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Get a property value, treating JSON `null` as absent.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    /// Return a copy with `patch` merged over the existing properties.
    pub fn merged_with(&self, patch: &Map<String, Value>) -> Self {
        let mut next = self.clone();
        for (k, v) in patch {
            next.properties.insert(k.clone(), v.clone());
        }
        next
    }
}
