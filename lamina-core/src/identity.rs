//! Identity types for lamina

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque token naming one optimistic layer.
///
/// Backed by a UUIDv7 so ids sort by creation time, which keeps debug
/// output of stacked layers readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptimisticId(Uuid);

impl OptimisticId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OptimisticId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_ids_are_unique() {
        let a = OptimisticId::new();
        let b = OptimisticId::new();
        assert_ne!(a, b);

    }
}
