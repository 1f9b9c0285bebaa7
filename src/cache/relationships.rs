//! Relationship index
//!
//! Edges live in one namespace-wide table indexed on both ends. A record's
//! outgoing edges are replaced wholesale inside the transaction that writes
//! the record, and every edge touching a deleted record is removed inside
//! the transaction that deletes it. [`RelationshipIndex`] serves forward and
//! reverse lookups plus one-hop traversal for readers.

use super::data_store::CacheDataStore;
use super::sqlite::{placeholders, SqliteStore};
use crate::metrics::Operation;
use crate::Result;
use cache_record::{CacheRecord, RecordKey, RelationshipEdge, Relationships};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const EDGE_COLUMNS: &str = "source_type, source_id, relationship_type, target_type, target_id";

/// Replace the stored outgoing edges of `record` with its declared set
pub(crate) fn replace_outgoing(conn: &Connection, rel_table: &str, record: &CacheRecord) -> Result<()> {
    conn.prepare_cached(&format!(
        "DELETE FROM {rel_table} WHERE source_type = ?1 AND source_id = ?2"
    ))?
    .execute(params![record.cache_type(), record.id()])?;

    let mut insert = conn.prepare_cached(&format!(
        "INSERT OR IGNORE INTO {rel_table} ({EDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
    ))?;
    for edge in record.edges() {
        insert.execute(params![
            edge.source.cache_type,
            edge.source.id,
            edge.relationship_type,
            edge.target.cache_type,
            edge.target.id,
        ])?;
    }

    Ok(())
}

/// Remove every edge from or to `(cache_type, id)`
pub(crate) fn remove_touching(
    conn: &Connection,
    rel_table: &str,
    cache_type: &str,
    id: &str,
) -> Result<usize> {
    let outgoing = conn
        .prepare_cached(&format!(
            "DELETE FROM {rel_table} WHERE source_type = ?1 AND source_id = ?2"
        ))?
        .execute(params![cache_type, id])?;
    let incoming = conn
        .prepare_cached(&format!(
            "DELETE FROM {rel_table} WHERE target_type = ?1 AND target_id = ?2"
        ))?
        .execute(params![cache_type, id])?;
    Ok(outgoing + incoming)
}

/// Load the relationship sets of the given source ids
pub(crate) fn load_outgoing(
    conn: &Connection,
    rel_table: &str,
    cache_type: &str,
    ids: &[String],
) -> Result<HashMap<String, Relationships>> {
    let mut by_source: HashMap<String, Relationships> = HashMap::new();
    if ids.is_empty() {
        return Ok(by_source);
    }

    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM {rel_table} WHERE source_type = ? AND source_id IN ({})",
        placeholders(ids.len())
    );
    let args = std::iter::once(cache_type).chain(ids.iter().map(String::as_str));
    for edge in query_edges(conn, &sql, params_from_iter(args))? {
        by_source
            .entry(edge.source.id)
            .or_default()
            .entry(edge.relationship_type)
            .or_default()
            .insert(edge.target);
    }
    Ok(by_source)
}

fn query_edges<P: rusqlite::Params>(conn: &Connection, sql: &str, args: P) -> Result<Vec<RelationshipEdge>> {
    let mut stmt = conn.prepare(sql)?;
    let edges = stmt
        .query_map(args, |row| {
            Ok(RelationshipEdge::new(
                RecordKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                row.get::<_, String>(2)?,
                RecordKey::new(row.get::<_, String>(3)?, row.get::<_, String>(4)?),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Forward and reverse edge lookups
#[derive(Debug, Clone)]
pub struct RelationshipIndex {
    store: Arc<SqliteStore>,
    data: Arc<CacheDataStore>,
}

impl RelationshipIndex {
    pub fn new(store: Arc<SqliteStore>, data: Arc<CacheDataStore>) -> Self {
        Self { store, data }
    }

    /// Edges declared by `source`, ordered
    pub async fn outgoing(&self, source: &RecordKey) -> Result<Vec<RelationshipEdge>> {
        let rel_table = self.store.names().relationships();
        let (cache_type, id) = (source.cache_type.clone(), source.id.clone());
        self.store
            .run(Operation::Relationships, source.cache_type(), move |conn| {
                let sql = format!(
                    "SELECT {EDGE_COLUMNS} FROM {rel_table} WHERE source_type = ?1 AND source_id = ?2 \
                     ORDER BY relationship_type, target_type, target_id"
                );
                query_edges(conn, &sql, params![cache_type, id])
            })
            .await
    }

    /// Edges pointing at `target` from anywhere (reverse lookup)
    pub async fn incoming(&self, target: &RecordKey) -> Result<Vec<RelationshipEdge>> {
        let rel_table = self.store.names().relationships();
        let (cache_type, id) = (target.cache_type.clone(), target.id.clone());
        self.store
            .run(Operation::Relationships, target.cache_type(), move |conn| {
                let sql = format!(
                    "SELECT {EDGE_COLUMNS} FROM {rel_table} WHERE target_type = ?1 AND target_id = ?2 \
                     ORDER BY source_type, source_id, relationship_type"
                );
                query_edges(conn, &sql, params![cache_type, id])
            })
            .await
    }

    /// One-hop traversal: the existing records `source` points at
    ///
    /// With `relationship_type`, only edges of that type are followed. Targets
    /// that no longer exist are skipped.
    pub async fn related(
        &self,
        source: &RecordKey,
        relationship_type: Option<&str>,
    ) -> Result<Vec<CacheRecord>> {
        let mut targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in self.outgoing(source).await? {
            if relationship_type.map_or(true, |wanted| wanted == edge.relationship_type) {
                targets
                    .entry(edge.target.cache_type)
                    .or_default()
                    .insert(edge.target.id);
            }
        }

        let mut records = Vec::new();
        for (cache_type, ids) in targets {
            records.extend(self.data.get_all(&cache_type, ids).await?);
        }
        Ok(records)
    }

    /// Edges whose target is of `cache_type` but does not exist
    pub async fn dangling_edges(&self, cache_type: &str) -> Result<Vec<RelationshipEdge>> {
        let table = self
            .data
            .registry()
            .lookup_as(Operation::Relationships, cache_type)
            .await?;
        let rel_table = self.store.names().relationships();
        let owned_type = cache_type.to_string();
        self.store
            .run(Operation::Relationships, cache_type, move |conn| {
                let sql = match &table {
                    Some(handle) => format!(
                        "SELECT {EDGE_COLUMNS} FROM {rel_table} r WHERE r.target_type = ?1 \
                         AND NOT EXISTS (SELECT 1 FROM {} t WHERE t.id = r.target_id) \
                         ORDER BY source_type, source_id",
                        handle.table()
                    ),
                    None => format!(
                        "SELECT {EDGE_COLUMNS} FROM {rel_table} WHERE target_type = ?1 \
                         ORDER BY source_type, source_id"
                    ),
                };
                query_edges(conn, &sql, params![owned_type])
            })
            .await
    }

    /// Total number of stored edges in this namespace
    pub async fn edge_count(&self) -> Result<usize> {
        let rel_table = self.store.names().relationships();
        self.store
            .run(Operation::Relationships, "_shared", move |conn| {
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {rel_table}"), [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }
}
