//! Read-only view of the cache
//!
//! Readers never mutate and never go through the merge path. Code that only
//! queries the cache should hold an `Arc<dyn CacheReader>`.

use crate::Result;
use async_trait::async_trait;
use cache_record::{CacheRecord, RecordKey, RelationshipEdge};
use std::collections::BTreeSet;

/// Snapshot reads over committed cache state
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// One record, or `None` when it does not exist
    async fn get(&self, cache_type: &str, id: &str) -> Result<Option<CacheRecord>>;

    /// The listed records that exist; missing ids are omitted
    async fn get_all(&self, cache_type: &str, ids: &[String]) -> Result<Vec<CacheRecord>>;

    /// The subset of `ids` that currently exist
    async fn filter_identifiers(&self, cache_type: &str, ids: &[String]) -> Result<BTreeSet<String>>;

    /// Existing records `source` points at, optionally only through one relationship type
    async fn related(
        &self,
        source: &RecordKey,
        relationship_type: Option<&str>,
    ) -> Result<Vec<CacheRecord>>;

    /// Edges pointing at `target`
    async fn referencing(&self, target: &RecordKey) -> Result<Vec<RelationshipEdge>>;
}
