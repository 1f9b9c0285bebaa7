//! Typed record storage
//!
//! CRUD over cache records, one physical table per cache type. Every call is
//! one or more retried units of work and emits a metrics observation.

use super::relationships;
use super::schema::{SchemaRegistry, TableHandle};
use super::sqlite::{placeholders, SqliteStore};
use crate::clock::millis_to_datetime;
use crate::metrics::Operation;
use crate::{CacheError, Result};
use cache_record::CacheRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Summary of one cache type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStats {
    pub cache_type: String,
    pub records: usize,
    pub oldest_write: Option<DateTime<Utc>>,
    pub newest_write: Option<DateTime<Utc>>,
}

/// Row selection for identifier listings
enum IdFilter {
    All,
    Glob(String),
    WrittenBefore(i64),
}

/// Sort, dedupe and own a caller-supplied id collection
fn collect_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter()
        .map(Into::into)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Record storage over the schema registry
pub struct CacheDataStore {
    store: Arc<SqliteStore>,
    registry: Arc<SchemaRegistry>,
    read_batch_size: usize,
}

impl CacheDataStore {
    pub fn new(store: Arc<SqliteStore>, registry: Arc<SchemaRegistry>, read_batch_size: usize) -> Self {
        Self {
            store,
            registry,
            read_batch_size: read_batch_size.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Fetch one record
    pub async fn get(&self, cache_type: &str, id: &str) -> Result<Option<CacheRecord>> {
        let found = self
            .fetch(Operation::Get, cache_type, vec![id.to_string()])
            .await?;
        Ok(found.into_iter().next())
    }

    /// Fetch every listed record that exists, ordered by id
    ///
    /// Missing ids are omitted. Lists longer than the read batch size are
    /// split into several queries.
    pub async fn get_all<I, S>(&self, cache_type: &str, ids: I) -> Result<Vec<CacheRecord>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch(Operation::GetAll, cache_type, collect_ids(ids))
            .await
    }

    async fn fetch(&self, operation: Operation, cache_type: &str, ids: Vec<String>) -> Result<Vec<CacheRecord>> {
        let Some(table) = self.readable(operation, cache_type, &ids).await? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.read_batch_size) {
            let chunk = chunk.to_vec();
            let table = table.clone();
            let rel_table = self.store.names().relationships();
            let owned_type = cache_type.to_string();
            let found = self
                .store
                .run(operation, cache_type, move |conn| {
                    read_records(conn, &owned_type, &table, &rel_table, &chunk)
                })
                .await?;
            records.extend(found);
        }
        Ok(records)
    }

    /// The subset of `ids` that currently exist
    pub async fn filter_identifiers<I, S>(&self, cache_type: &str, ids: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = collect_ids(ids);
        let Some(table) = self
            .readable(Operation::FilterIdentifiers, cache_type, &ids)
            .await?
        else {
            return Ok(BTreeSet::new());
        };

        let mut existing = BTreeSet::new();
        for chunk in ids.chunks(self.read_batch_size) {
            let chunk = chunk.to_vec();
            let table = table.clone();
            let found = self
                .store
                .run(Operation::FilterIdentifiers, cache_type, move |conn| {
                    query_ids(
                        conn,
                        &format!("SELECT id FROM {table} WHERE id IN ({})", placeholders(chunk.len())),
                        params_from_iter(chunk.iter()),
                    )
                })
                .await?;
            existing.extend(found);
        }
        Ok(existing)
    }

    /// Every id stored for `cache_type`
    pub async fn identifiers(&self, cache_type: &str) -> Result<BTreeSet<String>> {
        self.identifiers_where(cache_type, IdFilter::All).await
    }

    /// Ids matching a SQLite GLOB pattern (`*`, `?`, `[...]`)
    pub async fn identifiers_matching(&self, cache_type: &str, pattern: &str) -> Result<BTreeSet<String>> {
        self.identifiers_where(cache_type, IdFilter::Glob(pattern.to_string()))
            .await
    }

    /// Ids whose last write is older than `max_age` according to the engine clock
    pub async fn stale_identifiers(&self, cache_type: &str, max_age: Duration) -> Result<BTreeSet<String>> {
        let age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.store.clock().now_millis().saturating_sub(age);
        self.identifiers_where(cache_type, IdFilter::WrittenBefore(cutoff))
            .await
    }

    async fn identifiers_where(&self, cache_type: &str, filter: IdFilter) -> Result<BTreeSet<String>> {
        let Some(table) = self
            .registry
            .lookup_as(Operation::ListIdentifiers, cache_type)
            .await?
        else {
            return Ok(BTreeSet::new());
        };
        let table = table.table().to_string();
        self.store
            .run(Operation::ListIdentifiers, cache_type, move |conn| {
                let base = format!("SELECT id FROM {table}");
                match &filter {
                    IdFilter::All => query_ids(conn, &base, []),
                    IdFilter::Glob(pattern) => {
                        query_ids(conn, &format!("{base} WHERE id GLOB ?1"), params![pattern])
                    }
                    IdFilter::WrittenBefore(cutoff) => query_ids(
                        conn,
                        &format!("{base} WHERE last_written < ?1"),
                        params![cutoff],
                    ),
                }
            })
            .await
    }

    /// Record count and write-time range of `cache_type`
    pub async fn stats(&self, cache_type: &str) -> Result<TypeStats> {
        let mut stats = TypeStats {
            cache_type: cache_type.to_string(),
            records: 0,
            oldest_write: None,
            newest_write: None,
        };
        let Some(table) = self
            .registry
            .lookup_as(Operation::ListIdentifiers, cache_type)
            .await?
        else {
            return Ok(stats);
        };

        let table = table.table().to_string();
        let (count, oldest, newest) = self
            .store
            .run(Operation::ListIdentifiers, cache_type, move |conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*), MIN(last_written), MAX(last_written) FROM {table}"),
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )?)
            })
            .await?;

        stats.records = count as usize;
        stats.oldest_write = oldest.map(millis_to_datetime);
        stats.newest_write = newest.map(millis_to_datetime);
        Ok(stats)
    }

    /// Write `records` as one transaction, stamped with `agent` and the clock
    ///
    /// Attributes and relationship sets of each record are replaced; ids not in
    /// the batch are untouched. Rows are written in increasing id order.
    pub async fn upsert_batch(
        &self,
        agent: &str,
        cache_type: &str,
        records: Vec<CacheRecord>,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(stray) = records.iter().find(|r| r.cache_type() != cache_type) {
            return Err(CacheError::InvalidRecord(format!(
                "record {} does not belong to type '{}'",
                stray.key, cache_type
            )));
        }

        let table = self.registry.ensure_table(cache_type).await?;

        // Last occurrence of a duplicated id wins
        let sorted: BTreeMap<String, CacheRecord> = records
            .into_iter()
            .map(|mut r| {
                r.prune_empty_relationships();
                (r.key.id.clone(), r)
            })
            .collect();
        let records: Vec<CacheRecord> = sorted.into_values().collect();

        let rel_table = self.store.names().relationships();
        let agent = agent.to_string();
        let now = self.store.clock().now_millis();

        self.store
            .run(Operation::Upsert, cache_type, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                {
                    let mut upsert = tx.prepare_cached(&format!(
                        "INSERT INTO {} (id, attributes, last_written, writer_agent) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT(id) DO UPDATE SET attributes = excluded.attributes, \
                         last_written = excluded.last_written, writer_agent = excluded.writer_agent",
                        table.table()
                    ))?;
                    for record in &records {
                        let attributes = serde_json::to_string(&record.attributes)?;
                        upsert.execute(params![record.id(), attributes, now, agent])?;
                        relationships::replace_outgoing(&tx, &rel_table, record)?;
                    }
                }
                tx.commit()?;
                Ok(records.len())
            })
            .await
    }

    /// Delete records and every edge from or to them; returns rows removed
    pub async fn delete_batch<I, S>(&self, cache_type: &str, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = collect_ids(ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let table = self.registry.lookup_as(Operation::Delete, cache_type).await?;
        let rel_table = self.store.names().relationships();
        let owned_type = cache_type.to_string();

        let removed = self
            .store
            .run(Operation::Delete, cache_type, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut removed = 0;
                for id in &ids {
                    if let Some(table) = &table {
                        removed += tx
                            .prepare_cached(&format!("DELETE FROM {} WHERE id = ?1", table.table()))?
                            .execute(params![id])?;
                    }
                    relationships::remove_touching(&tx, &rel_table, &owned_type, id)?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await?;

        tracing::debug!(cache_type, removed, "Deleted cache records");
        Ok(removed)
    }

    /// Ids `agent` reported for `cache_type` in its last completed round
    pub async fn report_state(&self, agent: &str, cache_type: &str) -> Result<BTreeSet<String>> {
        let reports = self.store.names().agent_reports();
        let (agent, owned_type) = (agent.to_string(), cache_type.to_string());
        self.store
            .run(Operation::ListIdentifiers, cache_type, move |conn| {
                query_ids(
                    conn,
                    &format!("SELECT id FROM {reports} WHERE agent = ?1 AND type = ?2"),
                    params![agent, owned_type],
                )
            })
            .await
    }

    /// Delete `stale` and record the new report state of `agent`, atomically
    ///
    /// With `owned_only`, stale ids whose last writer is another agent are
    /// left alone. Edges touching a stale id that no longer exists are
    /// pruned. Returns the ids actually deleted.
    pub(crate) async fn evict(
        &self,
        agent: &str,
        cache_type: &str,
        stale: BTreeSet<String>,
        next_state: BTreeSet<String>,
        owned_only: bool,
    ) -> Result<Vec<String>> {
        let table = self.registry.lookup_as(Operation::Evict, cache_type).await?;
        let rel_table = self.store.names().relationships();
        let reports = self.store.names().agent_reports();
        let (agent, owned_type) = (agent.to_string(), cache_type.to_string());

        self.store
            .run(Operation::Evict, cache_type, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut deleted = Vec::new();
                for id in &stale {
                    let gone = match &table {
                        Some(table) => {
                            let removed = if owned_only {
                                tx.prepare_cached(&format!(
                                    "DELETE FROM {} WHERE id = ?1 AND writer_agent = ?2",
                                    table.table()
                                ))?
                                .execute(params![id, agent])?
                            } else {
                                tx.prepare_cached(&format!("DELETE FROM {} WHERE id = ?1", table.table()))?
                                    .execute(params![id])?
                            };
                            if removed == 1 {
                                deleted.push(id.clone());
                                true
                            } else {
                                !row_exists(&tx, table, id)?
                            }
                        }
                        None => true,
                    };
                    if gone {
                        relationships::remove_touching(&tx, &rel_table, &owned_type, id)?;
                    }
                }

                tx.execute(
                    &format!("DELETE FROM {reports} WHERE agent = ?1 AND type = ?2"),
                    params![agent, owned_type],
                )?;
                {
                    let mut insert = tx.prepare_cached(&format!(
                        "INSERT INTO {reports} (agent, type, id) VALUES (?1, ?2, ?3)"
                    ))?;
                    for id in &next_state {
                        insert.execute(params![agent, owned_type, id])?;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    /// Resolve the table for a read, or `None` when nothing could match
    ///
    /// A `None` still counts as one `operation` observation.
    async fn readable(
        &self,
        operation: Operation,
        cache_type: &str,
        ids: &[String],
    ) -> Result<Option<String>> {
        if ids.is_empty() {
            self.store.observe_skipped(operation, cache_type);
            return Ok(None);
        }
        let table = self.registry.lookup_as(operation, cache_type).await?;
        Ok(table.map(|handle| handle.table().to_string()))
    }
}

impl std::fmt::Debug for CacheDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDataStore")
            .field("store", &self.store)
            .field("read_batch_size", &self.read_batch_size)
            .finish()
    }
}

fn row_exists(conn: &Connection, table: &TableHandle, id: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(&format!("SELECT 1 FROM {} WHERE id = ?1", table.table()))?;
    Ok(stmt.exists(params![id])?)
}

fn query_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, args: P) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(args, |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

/// Read rows and their outgoing edges from one snapshot
fn read_records(
    conn: &mut Connection,
    cache_type: &str,
    table: &str,
    rel_table: &str,
    ids: &[String],
) -> Result<Vec<CacheRecord>> {
    let tx = conn.transaction()?;

    let rows: Vec<(String, String, i64, String)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT id, attributes, last_written, writer_agent FROM {table} \
             WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let found: Vec<String> = rows.iter().map(|(id, ..)| id.clone()).collect();
    let mut edges = relationships::load_outgoing(&tx, rel_table, cache_type, &found)?;

    rows.into_iter()
        .map(|(id, attributes, last_written, writer_agent)| {
            let mut record = CacheRecord::new(cache_type, id.clone());
            record.attributes = serde_json::from_str(&attributes)?;
            record.relationships = edges.remove(&id).unwrap_or_default();
            record.last_written = Some(millis_to_datetime(last_written));
            record.writer_agent = Some(writer_agent);
            Ok(record)
        })
        .collect()
}
