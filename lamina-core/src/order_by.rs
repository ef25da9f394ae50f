//! Sort clauses.

use serde::{Deserialize, Serialize};

/// Direction of one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One `(property, direction)` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTerm {
    pub property: String,
    pub direction: SortDirection,
}

/// Ordered list of sort terms. Earlier terms take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OrderBy {
    pub terms: Vec<OrderTerm>,
}

impl OrderBy {
    /// The empty ordering.
    pub fn none() -> Self {
        Self::default()
    }

    /// Append an ascending term.
    pub fn asc(mut self, property: impl Into<String>) -> Self {
        self.terms.push(OrderTerm {
            property: property.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    /// Append a descending term.
    pub fn desc(mut self, property: impl Into<String>) -> Self {
        self.terms.push(OrderTerm {
            property: property.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}
