//! Where-clause expressions for list, link and aggregation queries.
//!
//! The shape mirrors the backing service's filter language closely enough
//! to be forwarded unchanged, while still letting the cache evaluate most
//! clauses locally when deciding whether a freshly written object belongs
//! in an already-materialized list.

use crate::ObjectSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
    /// String prefix match
    StartsWith,
    /// Property is (or is not, when the operand is `false`) null
    IsNull,
    /// Matches regular expression. Only the server can evaluate this.
    Regex,
}

/// Filter applied to a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyFilter {
    /// Bare value, shorthand for `{eq: value}`.
    Equals(Value),
    /// One or more operators, all of which must hold.
    Operators(BTreeMap<FilterOperator, Value>),
}

impl PropertyFilter {
    /// A single-operator filter.
    pub fn op(operator: FilterOperator, value: impl Into<Value>) -> Self {
        let mut ops = BTreeMap::new();
        ops.insert(operator, value.into());
        Self::Operators(ops)
    }

    fn matches(&self, actual: Option<&Value>, strict: bool) -> bool {
        match self {
            Self::Equals(expected) => value_equals(actual, expected),
            Self::Operators(ops) => ops
                .iter()
                .all(|(op, operand)| operator_matches(*op, actual, operand, strict)),
        }
    }
}

/// Unified filter expression for queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WhereClause {
    /// All sub-clauses must hold.
    And(Vec<WhereClause>),
    /// At least one sub-clause must hold. Empty matches everything, the
    /// same way the backing service treats an empty disjunction.
    Or(Vec<WhereClause>),
    /// The sub-clause must not hold.
    Not(Box<WhereClause>),
    /// Per-property filters, all of which must hold. Empty matches everything.
    Properties(BTreeMap<String, PropertyFilter>),
}

impl Default for WhereClause {
    fn default() -> Self {
        Self::all()
    }
}

impl WhereClause {
    /// The empty filter, matching every object.
    pub fn all() -> Self {
        Self::Properties(BTreeMap::new())
    }

    /// `{field: value}`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(field, PropertyFilter::Equals(value.into()))
    }

    /// `{field: filter}`
    pub fn property(field: impl Into<String>, filter: PropertyFilter) -> Self {
        let mut props = BTreeMap::new();
        props.insert(field.into(), filter);
        Self::Properties(props)
    }

    pub fn and(clauses: Vec<WhereClause>) -> Self {
        Self::And(clauses)
    }

    pub fn or(clauses: Vec<WhereClause>) -> Self {
        Self::Or(clauses)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: WhereClause) -> Self {
        Self::Not(Box::new(clause))
    }

    /// Returns true if this is the empty filter.
    pub fn is_all(&self) -> bool {
        matches!(self, Self::Properties(p) if p.is_empty())
    }

    /// Evaluate the clause against an object.
    ///
    /// With `strict` set, operators the client cannot evaluate count as
    /// non-matching; otherwise they count as matching. An object that
    /// matches loosely but not strictly needs a server round trip to decide.
    pub fn matches(&self, object: &ObjectSnapshot, strict: bool) -> bool {
        match self {
            Self::And(clauses) => clauses.iter().all(|c| c.matches(object, strict)),
            Self::Or(clauses) => {
                clauses.is_empty() || clauses.iter().any(|c| c.matches(object, strict))
            }
            Self::Not(inner) => !inner.matches(object, !strict),
            Self::Properties(props) => props
                .iter()
                .all(|(field, filter)| filter.matches(object.property(field), strict)),
        }
    }

    /// Classify how an object relates to this clause.
    pub fn match_kind(&self, object: &ObjectSnapshot) -> MatchKind {
        if self.matches(object, true) {
            MatchKind::Strict
        } else if self.matches(object, false) {
            MatchKind::Possible
        } else {
            MatchKind::None
        }
    }
}

/// Outcome of evaluating a clause on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Definitely does not match.
    None,
    /// Might match; only the server can tell.
    Possible,
    /// Definitely matches.
    Strict,
}

/// Compare two JSON scalars of the same kind.
///
/// Returns `None` for mismatched kinds, nulls, arrays and objects.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn value_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(a), e) => a == e || compare_values(a, e) == Some(Ordering::Equal),
    }
}

fn operator_matches(op: FilterOperator, actual: Option<&Value>, operand: &Value, strict: bool) -> bool {
    match op {
        FilterOperator::Eq => value_equals(actual, operand),
        FilterOperator::Ne => !value_equals(actual, operand),
        FilterOperator::Gt => ordered(actual, operand, |o| o == Ordering::Greater),
        FilterOperator::Gte => ordered(actual, operand, |o| o != Ordering::Less),
        FilterOperator::Lt => ordered(actual, operand, |o| o == Ordering::Less),
        FilterOperator::Lte => ordered(actual, operand, |o| o != Ordering::Greater),
        FilterOperator::In => match operand {
            Value::Array(items) => items.iter().any(|item| value_equals(actual, item)),
            _ => false,
        },
        FilterOperator::Contains => match (actual, operand) {
            (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.contains(needle),
            _ => false,
        },
        FilterOperator::StartsWith => match (actual, operand) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        FilterOperator::IsNull => {
            let want_null = operand.as_bool().unwrap_or(true);
            actual.is_none() == want_null
        }
        FilterOperator::Regex => !strict,
    }
}

fn ordered(actual: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|a| compare_values(a, operand))
        .map(accept)
        .unwrap_or(false)
}
