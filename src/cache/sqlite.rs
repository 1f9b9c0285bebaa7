//! SQLite backing store plumbing
//!
//! Connection pooling, physical table naming and the retried unit of work
//! every cache component runs its SQL through.

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::metrics::{MetricsRecorder, Operation, Outcome};
use crate::retry::RetryExecutor;
use crate::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Fixed set of SQLite connections to one database file
///
/// Each unit of work checks out one connection for its whole duration and
/// runs on the blocking thread pool. The connection is released when the
/// guard drops, whichever way the work exits.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: Vec<Arc<Mutex<Connection>>>,
    cursor: AtomicUsize,
    path: PathBuf,
}

impl ConnectionPool {
    /// Open `pool_size` connections to the configured database
    pub fn open(config: &StoreConfig) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(
            path = %config.path.display(),
            pool_size = config.pool_size,
            "Opening cache database"
        );

        let connections = (0..config.pool_size.max(1))
            .map(|_| Self::open_connection(config).map(|c| Arc::new(Mutex::new(c))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            connections,
            cursor: AtomicUsize::new(0),
            path: config.path.clone(),
        })
    }

    fn open_connection(config: &StoreConfig) -> Result<Connection> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;

        // WAL gives readers a committed snapshot without blocking the writer
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Ok(conn)
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Pick a connection, preferring one nobody holds right now
    fn checkout(&self) -> Arc<Mutex<Connection>> {
        let len = self.connections.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let slot = &self.connections[(start + offset) % len];
            if slot.try_lock().is_ok() {
                return Arc::clone(slot);
            }
        }
        Arc::clone(&self.connections[start % len])
    }

    /// Run `work` with exclusive use of one pooled connection
    pub async fn with_connection<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.checkout();
        tokio::task::spawn_blocking(move || {
            // A panic mid-transaction already rolled back when the Transaction dropped
            let mut conn = slot.lock().unwrap_or_else(|e| e.into_inner());
            work(&mut conn)
        })
        .await?
    }
}

/// Quote an identifier for use in SQL, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build `?, ?, ?` with `count` placeholders
pub fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

/// Physical table names under one namespace
///
/// Every name is `{namespace}:{kind}` where the namespace never contains `:`.
/// Per-type tables put the cache type after a `records:` kind, so no cache
/// type can name a shared table and no two namespaces share a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    namespace: String,
}

impl TableNames {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn raw(&self, kind: &str) -> String {
        format!("{}:{}", self.namespace, kind)
    }

    /// Registry of created per-type tables
    pub fn types(&self) -> String {
        quote_identifier(&self.raw("cache_types"))
    }

    /// Shared edge table
    pub fn relationships(&self) -> String {
        quote_identifier(&self.raw("cache_relationships"))
    }

    /// Persisted per-(agent, type) report state
    pub fn agent_reports(&self) -> String {
        quote_identifier(&self.raw("agent_reports"))
    }

    /// Unquoted name of the table holding records of `cache_type`
    pub fn raw_type_table(&self, cache_type: &str) -> String {
        self.raw(&format!("records:{cache_type}"))
    }

    /// Unquoted name of the write-time index of `cache_type`
    pub fn raw_type_index(&self, cache_type: &str) -> String {
        self.raw(&format!("records_by_last_written:{cache_type}"))
    }

    fn index(&self, name: &str) -> String {
        quote_identifier(&self.raw(name))
    }

    /// DDL for the tables every namespace shares
    pub fn shared_schema(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {types} (
                type TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {rels} (
                source_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                relationship_type TEXT NOT NULL CHECK (length(relationship_type) > 0),
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                PRIMARY KEY (source_type, source_id, relationship_type, target_type, target_id)
            );

            CREATE TABLE IF NOT EXISTS {reports} (
                agent TEXT NOT NULL,
                type TEXT NOT NULL,
                id TEXT NOT NULL,
                PRIMARY KEY (agent, type, id)
            );

            CREATE INDEX IF NOT EXISTS {source_idx} ON {rels}(source_type, source_id);
            CREATE INDEX IF NOT EXISTS {target_idx} ON {rels}(target_type, target_id);
            "#,
            types = self.types(),
            rels = self.relationships(),
            reports = self.agent_reports(),
            source_idx = self.index("idx_relationships_source"),
            target_idx = self.index("idx_relationships_target"),
        )
    }
}

/// Everything a component needs to run retried, observed units of work
pub struct SqliteStore {
    pool: ConnectionPool,
    retry: RetryExecutor,
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
    names: TableNames,
}

impl SqliteStore {
    pub fn new(
        pool: ConnectionPool,
        retry: RetryExecutor,
        metrics: Arc<dyn MetricsRecorder>,
        clock: Arc<dyn Clock>,
        names: TableNames,
    ) -> Self {
        Self {
            pool,
            retry,
            metrics,
            clock,
            names,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn names(&self) -> &TableNames {
        &self.names
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Record an operation that finished without touching the store
    pub fn observe_skipped(&self, operation: Operation, cache_type: &str) {
        self.metrics
            .observe(operation, cache_type, Outcome::Success, 0);
    }

    /// Run one unit of work under the retry policy and record its outcome
    ///
    /// `work` may run several times, each time on a freshly checked out
    /// connection. Anything it does inside a transaction it did not commit is
    /// rolled back before the next attempt.
    pub async fn run<F, T>(&self, operation: Operation, cache_type: &str, work: F) -> Result<T>
    where
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let work = Arc::new(work);
        let pool = &self.pool;
        let started = Instant::now();

        let result = self
            .retry
            .run(operation.as_str(), move || {
                let work = Arc::clone(&work);
                pool.with_connection(move |conn| (*work)(conn))
            })
            .await;

        let elapsed = started.elapsed().as_nanos() as u64;
        match result {
            Ok(done) => {
                self.metrics.observe(
                    operation,
                    cache_type,
                    Outcome::from_attempts(done.attempts),
                    elapsed,
                );
                Ok(done.value)
            }
            Err(failed) => {
                self.metrics
                    .observe(operation, cache_type, Outcome::Failed, elapsed);
                tracing::debug!(
                    operation = %operation,
                    cache_type,
                    attempts = failed.attempts,
                    "Storage operation failed"
                );
                Err(failed.value)
            }
        }
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.pool.path())
            .field("pool_size", &self.pool.size())
            .field("names", &self.names)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::NoopMetrics;
    use crate::retry::RetryPolicy;

    /// Store config pointing at `path` with a short busy timeout
    pub fn store_config(path: &Path) -> StoreConfig {
        StoreConfig {
            path: path.to_path_buf(),
            pool_size: 2,
            wal_mode: true,
            busy_timeout_ms: 0,
        }
    }

    pub fn open_store(path: &Path, namespace: &str) -> SqliteStore {
        open_store_with(path, namespace, Arc::new(NoopMetrics), RetryPolicy::new(3, 1))
    }

    pub fn open_store_with(
        path: &Path,
        namespace: &str,
        metrics: Arc<dyn MetricsRecorder>,
        retry: RetryPolicy,
    ) -> SqliteStore {
        open_store_full(path, namespace, metrics, retry, Arc::new(SystemClock))
    }

    pub fn open_store_full(
        path: &Path,
        namespace: &str,
        metrics: Arc<dyn MetricsRecorder>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> SqliteStore {
        let pool = ConnectionPool::open(&store_config(path)).unwrap();
        SqliteStore::new(
            pool,
            RetryExecutor::new(retry),
            metrics,
            clock,
            TableNames::new(namespace),
        )
    }
}
