//! Type metadata, link traversal and aggregation descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Metadata describing one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// API name of the object type.
    pub api_name: String,
    /// Property holding the primary key.
    pub primary_key_field: String,
    /// Known property names.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Outgoing links keyed by link API name.
    #[serde(default)]
    pub links: BTreeMap<String, LinkMetadata>,
    /// Interfaces the type implements.
    #[serde(default)]
    pub interfaces: BTreeSet<String>,
}

impl ObjectMetadata {
    pub fn new(api_name: impl Into<String>, primary_key_field: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            primary_key_field: primary_key_field.into(),
            properties: Vec::new(),
            links: BTreeMap::new(),
            interfaces: BTreeSet::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    pub fn with_link(mut self, name: impl Into<String>, target_type: impl Into<String>, many: bool) -> Self {
        self.links.insert(
            name.into(),
            LinkMetadata {
                target_type: target_type.into(),
                many,
            },
        );
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.insert(interface.into());
        self
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    /// Target type of a link, if the link exists.
    pub fn link_target(&self, link: &str) -> Option<&str> {
        self.links.get(link).map(|l| l.target_type.as_str())
    }
}

/// One outgoing link of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetadata {
    /// Object type on the far side of the link.
    pub target_type: String,
    /// Whether the link is to-many.
    pub many: bool,
}

/// A traversal from a source object set through one or more links.
///
/// `links` is applied in order; the result type is the target of the
/// last link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PivotInfo {
    pub links: Vec<String>,
}

impl PivotInfo {
    pub fn through(links: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            links: links.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Aggregation metric applied to one property (or to the set, for `Count`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum AggregateMetric {
    Count,
    Min { property: String },
    Max { property: String },
    Sum { property: String },
    Avg { property: String },
    ApproximateDistinct { property: String },
}

/// Named metrics to compute, optionally grouped by properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// `(alias, metric)` pairs in caller order.
    pub metrics: Vec<(String, AggregateMetric)>,
    /// Properties to group by. Empty means a single ungrouped bucket.
    #[serde(default)]
    pub group_by: Vec<String>,
}

impl AggregateSpec {
    pub fn count() -> Self {
        Self {
            metrics: vec![("count".to_string(), AggregateMetric::Count)],
            group_by: Vec::new(),
        }
    }

    pub fn with_metric(mut self, alias: impl Into<String>, metric: AggregateMetric) -> Self {
        self.metrics.push((alias.into(), metric));
        self
    }

    pub fn grouped_by(mut self, property: impl Into<String>) -> Self {
        self.group_by.push(property.into());
        self
    }
}

/// One aggregation bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    /// Group-by values, empty when ungrouped.
    #[serde(default)]
    pub group: BTreeMap<String, Value>,
    /// Metric values keyed by alias.
    pub metrics: BTreeMap<String, Value>,
}

/// Result of an aggregation query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationResult {
    pub buckets: Vec<AggregationBucket>,
}

impl AggregationResult {
    /// Metric value in the first bucket, convenient for ungrouped aggregations.
    pub fn metric(&self, alias: &str) -> Option<&Value> {
        self.buckets.first().and_then(|b| b.metrics.get(alias))
    }
}
