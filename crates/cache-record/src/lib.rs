//! Typed cache records and the relationship edges derived from them.
//!
//! A [`CacheRecord`] is identified by a [`RecordKey`] (`type:id`), carries an
//! arbitrary JSON attribute map and a set of typed relationships pointing at
//! other keys. Edges are never stored on their own: they are derived from the
//! relationship set of their source record via [`CacheRecord::edges`].
//!
//! # Example
//!
//! ```
//! use cache_record::{CacheRecord, RecordKey};
//!
//! let subnet = CacheRecord::new("subnets", "subnet-1")
//!     .with_attribute("cidr", "10.0.1.0/24")
//!     .relate_id("vpcs", "vpc-7");
//!
//! assert_eq!(subnet.edges().count(), 1);
//! assert!(subnet.targets("vpcs").any(|k| k == &RecordKey::new("vpcs", "vpc-7")));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Attribute payload of a record
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Relationship sets keyed by relationship type
pub type Relationships = BTreeMap<String, BTreeSet<RecordKey>>;

/// Errors produced while parsing record keys
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("record key '{0}' is missing the ':' separator")]
    MissingSeparator(String),

    #[error("record key '{0}' has an empty type")]
    EmptyType(String),

    #[error("record key '{0}' has an empty id")]
    EmptyId(String),
}

/// Identity of a cache record: its logical type and its id within that type
///
/// Keys order by type first, then id, which gives merges a stable lock
/// acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub cache_type: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(cache_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            cache_type: cache_type.into(),
            id: id.into(),
        }
    }

    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cache_type, self.id)
    }
}

impl FromStr for RecordKey {
    type Err = KeyParseError;

    /// Parse `type:id`. Only the first `:` separates, so ids may contain colons
    /// (ARNs, URLs).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cache_type, id) = s
            .split_once(':')
            .ok_or_else(|| KeyParseError::MissingSeparator(s.to_string()))?;
        if cache_type.is_empty() {
            return Err(KeyParseError::EmptyType(s.to_string()));
        }
        if id.is_empty() {
            return Err(KeyParseError::EmptyId(s.to_string()));
        }
        Ok(Self::new(cache_type, id))
    }
}

/// A directed, typed pointer from one record to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source: RecordKey,
    pub relationship_type: String,
    pub target: RecordKey,
}

impl RelationshipEdge {
    pub fn new(
        source: RecordKey,
        relationship_type: impl Into<String>,
        target: RecordKey,
    ) -> Self {
        Self {
            source,
            relationship_type: relationship_type.into(),
            target,
        }
    }
}

impl fmt::Display for RelationshipEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source, self.relationship_type, self.target
        )
    }
}

/// The unit of stored state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: RecordKey,

    #[serde(default)]
    pub attributes: Attributes,

    /// Complete relationship view of this record; a merge replaces the stored set
    #[serde(default)]
    pub relationships: Relationships,

    /// Set by the engine when the record is written
    #[serde(default)]
    pub last_written: Option<DateTime<Utc>>,

    /// Agent that most recently authored the record, set by the engine
    #[serde(default)]
    pub writer_agent: Option<String>,
}

impl CacheRecord {
    /// Create an empty record for `(cache_type, id)`
    pub fn new(cache_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::from_key(RecordKey::new(cache_type, id))
    }

    pub fn from_key(key: RecordKey) -> Self {
        Self {
            key,
            attributes: Attributes::new(),
            relationships: Relationships::new(),
            last_written: None,
            writer_agent: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn cache_type(&self) -> &str {
        &self.key.cache_type
    }

    /// Set a single attribute
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Replace the whole attribute map
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Add a relationship to a fully qualified target
    pub fn relate(mut self, relationship_type: impl Into<String>, target: RecordKey) -> Self {
        self.relationships
            .entry(relationship_type.into())
            .or_default()
            .insert(target);
        self
    }

    /// Add a relationship to a bare id
    ///
    /// The relationship type doubles as the target's cache type, so
    /// `relate_id("vpcs", "vpc-7")` points at `vpcs:vpc-7`.
    pub fn relate_id(self, relationship_type: impl Into<String>, id: impl Into<String>) -> Self {
        let relationship_type = relationship_type.into();
        let target = RecordKey::new(relationship_type.clone(), id);
        self.relate(relationship_type, target)
    }

    /// Targets declared under one relationship type
    pub fn targets<'a>(&'a self, relationship_type: &str) -> impl Iterator<Item = &'a RecordKey> {
        self.relationships
            .get(relationship_type)
            .into_iter()
            .flat_map(|targets| targets.iter())
    }

    /// Derive the outgoing edges of this record
    pub fn edges(&self) -> impl Iterator<Item = RelationshipEdge> + '_ {
        self.relationships
            .iter()
            .flat_map(move |(relationship_type, targets)| {
                targets.iter().map(move |target| {
                    RelationshipEdge::new(self.key.clone(), relationship_type.clone(), target.clone())
                })
            })
    }

    /// Total number of declared edges
    pub fn edge_count(&self) -> usize {
        self.relationships.values().map(BTreeSet::len).sum()
    }

    /// Relationship types with at least one target
    ///
    /// A type declared with no targets contributes no edges, so it is not
    /// stored and does not come back on read.
    pub fn declared_relationships(&self) -> impl Iterator<Item = (&String, &BTreeSet<RecordKey>)> {
        self.relationships
            .iter()
            .filter(|(_, targets)| !targets.is_empty())
    }

    /// Drop relationship types that have no targets
    pub fn prune_empty_relationships(&mut self) {
        self.relationships.retain(|_, targets| !targets.is_empty());
    }

    /// Compare the user-supplied content (attributes and relationships) of two
    /// records, ignoring the engine-maintained write metadata
    ///
    /// Relationships compare by their edges, so an empty target set equals
    /// an absent one.
    pub fn same_content(&self, other: &CacheRecord) -> bool {
        self.key == other.key
            && self.attributes == other.attributes
            && self.declared_relationships().eq(other.declared_relationships())
    }
}
