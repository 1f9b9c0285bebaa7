//! Lazily created per-type tables
//!
//! The first merge of a cache type creates its physical table. Creation runs
//! at most once per process per type: concurrent first callers share one
//! `OnceCell` and wait on the same attempt. Across processes the create is
//! idempotent and the `cache_types` row decides who created it.
//!
//! Physical names come from [`TableNames`](super::TableNames); a cache type
//! can be any non-empty string, including the names of the shared tables.

use super::sqlite::{quote_identifier, SqliteStore};
use crate::metrics::Operation;
use crate::{CacheError, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Label used for metrics on namespace-wide tables
const SHARED: &str = "_shared";

/// Resolved physical table of one cache type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    cache_type: String,
    table: String,
}

impl TableHandle {
    fn new(cache_type: &str, raw_table: &str) -> Self {
        Self {
            cache_type: cache_type.to_string(),
            table: quote_identifier(raw_table),
        }
    }

    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    /// Quoted table name, ready to splice into SQL
    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Registry of physical tables keyed by logical cache type
pub struct SchemaRegistry {
    store: Arc<SqliteStore>,
    tables: Mutex<HashMap<String, Arc<OnceCell<TableHandle>>>>,
    creations: AtomicUsize,
}

impl SchemaRegistry {
    /// Bootstrap the namespace-wide tables and return an empty registry
    pub async fn open(store: Arc<SqliteStore>) -> Result<Self> {
        let ddl = store.names().shared_schema();
        store
            .run(Operation::EnsureTable, SHARED, move |conn| {
                conn.execute_batch(&ddl)?;
                Ok(())
            })
            .await
            .map_err(|e| CacheError::SchemaCreation {
                cache_type: SHARED.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            store,
            tables: Mutex::new(HashMap::new()),
            creations: AtomicUsize::new(0),
        })
    }

    fn cell(&self, cache_type: &str) -> Arc<OnceCell<TableHandle>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(tables.entry(cache_type.to_string()).or_default())
    }

    fn cached(&self, cache_type: &str) -> Option<TableHandle> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(cache_type).and_then(|cell| cell.get().cloned())
    }

    /// Return the table for `cache_type`, creating it on first use
    ///
    /// # Errors
    /// [`CacheError::SchemaCreation`] when the table cannot be created. The
    /// failure is not cached; a later call makes one fresh attempt.
    pub async fn ensure_table(&self, cache_type: &str) -> Result<TableHandle> {
        if cache_type.is_empty() {
            return Err(CacheError::SchemaCreation {
                cache_type: String::new(),
                message: "cache type cannot be empty".to_string(),
            });
        }

        if let Some(handle) = self.cached(cache_type) {
            return Ok(handle);
        }

        let cell = self.cell(cache_type);
        let handle = cell
            .get_or_try_init(|| self.create_table(cache_type))
            .await?;
        Ok(handle.clone())
    }

    async fn create_table(&self, cache_type: &str) -> Result<TableHandle> {
        let names = self.store.names();
        let raw_table = names.raw_type_table(cache_type);
        let table = quote_identifier(&raw_table);
        let index = quote_identifier(&names.raw_type_index(cache_type));
        let types_table = names.types();
        let now = self.store.clock().now_millis();
        let owned_type = cache_type.to_string();
        let owned_raw = raw_table.clone();

        let created = self
            .store
            .run(Operation::EnsureTable, cache_type, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute_batch(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        id TEXT PRIMARY KEY CHECK (length(id) > 0),
                        attributes TEXT NOT NULL,
                        last_written INTEGER NOT NULL,
                        writer_agent TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS {index} ON {table}(last_written);
                    "#
                ))?;
                let inserted = tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {types_table} (type, table_name, created_at) VALUES (?1, ?2, ?3)"
                    ),
                    params![owned_type, owned_raw, now],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await
            .map_err(|e| {
                tracing::error!(cache_type, error = %e, "Failed to create cache table");
                CacheError::SchemaCreation {
                    cache_type: cache_type.to_string(),
                    message: e.to_string(),
                }
            })?;

        if created {
            self.creations.fetch_add(1, Ordering::SeqCst);
            tracing::info!(cache_type, table = %raw_table, "Created cache table");
        } else {
            tracing::debug!(cache_type, table = %raw_table, "Cache table already present");
        }

        Ok(TableHandle::new(cache_type, &raw_table))
    }

    /// Return the table for `cache_type` only if it already exists
    ///
    /// Readers use this so that querying an unknown type never creates tables.
    /// Tables created by other processes are picked up from the store.
    pub async fn lookup(&self, cache_type: &str) -> Result<Option<TableHandle>> {
        self.lookup_as(Operation::EnsureTable, cache_type).await
    }

    /// [`lookup`](Self::lookup), observed as part of the caller's `operation`
    pub(crate) async fn lookup_as(
        &self,
        operation: Operation,
        cache_type: &str,
    ) -> Result<Option<TableHandle>> {
        if let Some(handle) = self.cached(cache_type) {
            return Ok(Some(handle));
        }

        let types_table = self.store.names().types();
        let owned_type = cache_type.to_string();
        let raw_table: Option<String> = self
            .store
            .run(operation, cache_type, move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT table_name FROM {types_table} WHERE type = ?1"),
                        params![owned_type],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        Ok(raw_table.map(|raw_table| {
            let handle = TableHandle::new(cache_type, &raw_table);
            // Lost races are fine: whoever set it stored the same handle
            let _ = self.cell(cache_type).set(handle.clone());
            handle
        }))
    }

    /// Every cache type with a physical table, in name order
    pub async fn known_types(&self) -> Result<Vec<String>> {
        let types_table = self.store.names().types();
        self.store
            .run(Operation::ListIdentifiers, SHARED, move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT type FROM {types_table} ORDER BY type"))?;
                let types = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(types)
            })
            .await
    }

    /// Drop every table created under this namespace and forget all state
    ///
    /// Administrative reset; normal operation never drops tables.
    pub async fn reset(&self) -> Result<usize> {
        let names = self.store.names().clone();
        let dropped = self
            .store
            .run(Operation::Delete, SHARED, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let tables: Vec<String> = {
                    let mut stmt = tx.prepare(&format!("SELECT table_name FROM {}", names.types()))?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    rows.collect::<std::result::Result<Vec<_>, _>>()?
                };
                for table in &tables {
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)))?;
                }
                tx.execute(&format!("DELETE FROM {}", names.relationships()), [])?;
                tx.execute(&format!("DELETE FROM {}", names.agent_reports()), [])?;
                tx.execute(&format!("DELETE FROM {}", names.types()), [])?;
                tx.commit()?;
                Ok(tables.len())
            })
            .await?;

        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        tracing::warn!(tables = dropped, "Cache namespace reset");
        Ok(dropped)
    }

    /// Number of tables this process created
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("store", &self.store)
            .field("creations", &self.creations())
            .finish()
    }
}
