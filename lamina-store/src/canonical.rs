//! Canonical forms for where and order-by clauses.
//!
//! Two clauses that mean the same thing must collapse onto one cache key.
//! The canonicalizers normalize the shape of a clause and then hand out a
//! single shared instance per distinct normalized value, so downstream code
//! can compare canonical clauses by pointer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use lamina_core::{
    CacheResult, FilterOperator, InvariantError, OrderBy, PropertyFilter, WhereClause,
};
use serde::Serialize;

// ============================================================================
// CANONICAL WRAPPER
// ============================================================================

/// A value that has passed through a canonicalizer.
///
/// Equality and hashing are by identity: for one canonicalizer, deep-equal
/// inputs always produce the same instance.
pub struct Canonical<T>(Arc<T>);

impl<T> Canonical<T> {
    fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Returns true if both handles name the same canonical instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T> Clone for Canonical<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Deref for Canonical<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> PartialEq for Canonical<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Canonical<T> {}

impl<T> Hash for Canonical<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Canonical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// MEMO TABLE
// ============================================================================

/// Memoizes canonical instances by a stable serialization.
///
/// `by_output` owns one instance per normalized value; `by_input` maps raw
/// input shapes to the normalized serialization so repeat inputs skip the
/// rewrite step.
struct Memo<T> {
    by_input: HashMap<String, String>,
    by_output: HashMap<String, Canonical<T>>,
}

impl<T: Serialize> Memo<T> {
    fn new() -> Self {
        Self {
            by_input: HashMap::new(),
            by_output: HashMap::new(),
        }
    }

    fn canonicalize(
        &mut self,
        raw: &T,
        normalize: impl FnOnce(&T) -> CacheResult<T>,
    ) -> CacheResult<Canonical<T>> {
        let input_key = stable_key(raw)?;
        if let Some(output_key) = self.by_input.get(&input_key) {
            if let Some(found) = self.by_output.get(output_key) {
                return Ok(found.clone());
            }
        }

        let normalized = normalize(raw)?;
        let output_key = stable_key(&normalized)?;
        let canonical = self
            .by_output
            .entry(output_key.clone())
            .or_insert_with(|| Canonical::new(normalized))
            .clone();
        self.by_input.insert(input_key, output_key);
        Ok(canonical)
    }

    /// Drop instances nobody outside the memo holds any more.
    fn prune(&mut self) -> usize {
        let before = self.by_output.len();
        self.by_output.retain(|_, c| c.handle_count() > 1);
        let by_output = &self.by_output;
        self.by_input.retain(|_, out| by_output.contains_key(out));
        before - self.by_output.len()
    }

    fn len(&self) -> usize {
        self.by_output.len()
    }
}

fn stable_key<T: Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| {
        InvariantError::NonDeterministicCanonical {
            input: e.to_string(),
        }
        .into()
    })
}

fn lock_memo<T>(memo: &Mutex<Memo<T>>) -> CacheResult<std::sync::MutexGuard<'_, Memo<T>>> {
    memo.lock().map_err(|_| InvariantError::LockPoisoned.into())
}

// ============================================================================
// WHERE CLAUSE CANONICALIZER
// ============================================================================

/// Canonicalizer for where clauses.
///
/// Rules:
/// - `and`/`or` with no entries becomes the empty filter
/// - `and`/`or` with one entry becomes that entry
/// - nested `and` inside `and` (and `or` inside `or`) is flattened
/// - property filters inside one `and` are merged per field; a field with
///   several distinct filters keeps one single-field clause per filter
/// - `{field: {eq: v}}` becomes `{field: v}`
/// - `not(not(x))` becomes `x`
/// - remaining sub-clauses are ordered by their serialization and deduplicated
pub struct WhereClauseCanonicalizer {
    memo: Mutex<Memo<WhereClause>>,
}

impl WhereClauseCanonicalizer {
    pub fn new() -> Self {
        Self {
            memo: Mutex::new(Memo::new()),
        }
    }

    pub fn canonicalize(&self, raw: &WhereClause) -> CacheResult<Canonical<WhereClause>> {
        lock_memo(&self.memo)?.canonicalize(raw, normalize_where)
    }

    /// Drop canonical instances that are no longer referenced.
    pub fn prune(&self) -> CacheResult<usize> {
        Ok(lock_memo(&self.memo)?.prune())
    }

    pub fn len(&self) -> usize {
        lock_memo(&self.memo).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WhereClauseCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_where(clause: &WhereClause) -> CacheResult<WhereClause> {
    Ok(match clause {
        WhereClause::And(children) => normalize_and(children)?,
        WhereClause::Or(children) => normalize_or(children)?,
        WhereClause::Not(inner) => match normalize_where(inner)? {
            WhereClause::Not(twice) => *twice,
            other => WhereClause::Not(Box::new(other)),
        },
        WhereClause::Properties(props) => WhereClause::Properties(
            props
                .iter()
                .map(|(field, filter)| (field.clone(), normalize_property(filter)))
                .collect(),
        ),
    })
}

fn normalize_property(filter: &PropertyFilter) -> PropertyFilter {
    match filter {
        PropertyFilter::Operators(ops) if ops.len() == 1 => match ops.get(&FilterOperator::Eq) {
            Some(value) => PropertyFilter::Equals(value.clone()),
            None => filter.clone(),
        },
        _ => filter.clone(),
    }
}

fn normalize_and(children: &[WhereClause]) -> CacheResult<WhereClause> {
    let mut by_field: BTreeMap<String, Vec<PropertyFilter>> = BTreeMap::new();
    let mut complex: Vec<WhereClause> = Vec::new();

    let mut stack = children
        .iter()
        .rev()
        .map(normalize_where)
        .collect::<CacheResult<Vec<_>>>()?;
    while let Some(child) = stack.pop() {
        match child {
            WhereClause::And(nested) => stack.extend(nested.into_iter().rev()),
            WhereClause::Properties(props) => {
                for (field, filter) in props {
                    by_field.entry(field).or_default().push(filter);
                }
            }
            other => complex.push(other),
        }
    }

    // A field constrained once joins the merged map. A field constrained
    // several ways keeps one single-field clause per distinct filter.
    let mut merged: BTreeMap<String, PropertyFilter> = BTreeMap::new();
    for (field, filters) in by_field {
        let mut singles: Vec<WhereClause> = filters
            .into_iter()
            .map(|f| WhereClause::Properties(BTreeMap::from([(field.clone(), f)])))
            .collect();
        sort_and_dedup(&mut singles)?;
        if singles.len() == 1 {
            if let Some(WhereClause::Properties(props)) = singles.pop() {
                merged.extend(props);
            }
        } else {
            complex.extend(singles);
        }
    }

    let mut parts = Vec::with_capacity(complex.len() + 1);
    if !merged.is_empty() {
        parts.push(WhereClause::Properties(merged));
    }
    sort_and_dedup(&mut complex)?;
    parts.extend(complex);
    Ok(collapse(parts, WhereClause::And))
}

fn normalize_or(children: &[WhereClause]) -> CacheResult<WhereClause> {
    let mut parts: Vec<WhereClause> = Vec::new();
    let mut stack = children
        .iter()
        .rev()
        .map(normalize_where)
        .collect::<CacheResult<Vec<_>>>()?;
    while let Some(child) = stack.pop() {
        match child {
            WhereClause::Or(nested) => stack.extend(nested.into_iter().rev()),
            other => parts.push(other),
        }
    }
    if parts.iter().any(WhereClause::is_all) {
        return Ok(WhereClause::all());
    }
    sort_and_dedup(&mut parts)?;
    Ok(collapse(parts, WhereClause::Or))
}

fn collapse(mut parts: Vec<WhereClause>, wrap: fn(Vec<WhereClause>) -> WhereClause) -> WhereClause {
    match parts.len() {
        0 => WhereClause::all(),
        1 => parts.remove(0),
        _ => wrap(parts),
    }
}

fn sort_and_dedup(parts: &mut Vec<WhereClause>) -> CacheResult<()> {
    let mut keyed = parts
        .drain(..)
        .map(|c| stable_key(&c).map(|k| (k, c)))
        .collect::<CacheResult<Vec<(String, WhereClause)>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    parts.extend(keyed.into_iter().map(|(_, c)| c));
    Ok(())
}

// ============================================================================
// ORDER BY CANONICALIZER
// ============================================================================

/// Canonicalizer for sort clauses.
///
/// Every empty ordering maps to one shared instance; non-empty orderings are
/// kept term-for-term since term order is significant.
pub struct OrderByCanonicalizer {
    memo: Mutex<Memo<OrderBy>>,
}

impl OrderByCanonicalizer {
    pub fn new() -> Self {
        Self {
            memo: Mutex::new(Memo::new()),
        }
    }

    pub fn canonicalize(&self, raw: &OrderBy) -> CacheResult<Canonical<OrderBy>> {
        lock_memo(&self.memo)?.canonicalize(raw, |o| Ok(o.clone()))
    }

    pub fn prune(&self) -> CacheResult<usize> {
        Ok(lock_memo(&self.memo)?.prune())
    }
}

impl Default for OrderByCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}
