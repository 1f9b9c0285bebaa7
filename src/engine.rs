//! Engine facade wiring every component over one backing store

use crate::cache::{
    CacheDataStore, ConnectionPool, RelationshipIndex, SchemaRegistry, SqliteStore, TableNames,
    TypeStats,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config_result, EngineConfig};
use crate::eviction::{EvictionCoordinator, EvictionOutcome};
use crate::merge::{MergeStats, WriteMerger};
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::reader::CacheReader;
use crate::retry::RetryExecutor;
use crate::Result;
use async_trait::async_trait;
use cache_record::{CacheRecord, RecordKey, RelationshipEdge};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of one agent round
///
/// The merge part is always present once the merge ran. Eviction failing
/// leaves the report state untouched; the next round retries the same diff.
#[derive(Debug)]
pub struct RoundOutcome {
    pub merge: MergeStats,
    pub eviction: Result<EvictionOutcome>,
}

impl RoundOutcome {
    /// Every reported id was written and eviction succeeded
    pub fn is_complete(&self) -> bool {
        !self.merge.is_partial() && self.eviction.is_ok()
    }
}

/// Builder for [`CacheEngine`] with optional collaborator overrides
pub struct EngineBuilder {
    config: EngineConfig,
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration, open the store and bootstrap the namespace
    ///
    /// # Errors
    /// [`crate::CacheError::Configuration`] for invalid settings, storage
    /// errors when the database cannot be opened.
    pub async fn open(self) -> Result<CacheEngine> {
        let EngineBuilder {
            config,
            metrics,
            clock,
        } = self;
        validate_config_result(&config)?;

        let pool = ConnectionPool::open(&config.store)?;
        let store = Arc::new(SqliteStore::new(
            pool,
            RetryExecutor::new(config.retry.clone()),
            metrics,
            clock,
            TableNames::new(config.namespace.clone()),
        ));
        let registry = Arc::new(SchemaRegistry::open(Arc::clone(&store)).await?);
        let data = Arc::new(CacheDataStore::new(
            Arc::clone(&store),
            registry,
            config.read_batch_size,
        ));

        tracing::info!(
            namespace = %config.namespace,
            path = %config.store.path.display(),
            merge_batch_size = config.merge_batch_size,
            read_batch_size = config.read_batch_size,
            "Cache engine ready"
        );

        Ok(CacheEngine {
            index: RelationshipIndex::new(store, Arc::clone(&data)),
            merger: WriteMerger::new(Arc::clone(&data), config.merge_batch_size)
                .with_pacing(config.merge_pacing()),
            eviction: EvictionCoordinator::new(Arc::clone(&data))
                .with_own_writes_only(config.evict_own_writes_only),
            data,
            config,
        })
    }
}

/// Typed, relationship-aware cache over SQLite
///
/// Collection agents call [`CacheEngine::merge_all`] once per round with
/// their complete view of a type. Readers use the [`CacheReader`] methods.
#[derive(Debug)]
pub struct CacheEngine {
    config: EngineConfig,
    data: Arc<CacheDataStore>,
    index: RelationshipIndex,
    merger: WriteMerger,
    eviction: EvictionCoordinator,
}

impl CacheEngine {
    /// Open with the default (no-op) metrics and the system clock
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data(&self) -> &CacheDataStore {
        &self.data
    }

    pub fn relationships(&self) -> &RelationshipIndex {
        &self.index
    }

    pub fn eviction(&self) -> &EvictionCoordinator {
        &self.eviction
    }

    /// Fetch a record by its `type:id` key
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheRecord>> {
        let key: RecordKey = key.parse()?;
        self.data.get(key.cache_type(), key.id()).await
    }

    /// One agent round: merge the complete view, then evict what dropped out
    ///
    /// # Errors
    /// Only when the type's table cannot be created. Partial merges and
    /// eviction failures are reported in [`RoundOutcome`].
    pub async fn merge_all(
        &self,
        agent: &str,
        cache_type: &str,
        records: Vec<CacheRecord>,
    ) -> Result<RoundOutcome> {
        self.eviction.begin_round(agent, cache_type);
        let report = self.merger.merge_all(agent, cache_type, records).await?;
        let eviction = self.eviction.evict_stale(&report).await;
        Ok(RoundOutcome {
            merge: report.into_stats(),
            eviction,
        })
    }

    /// Merge without evicting, for partial or incremental views
    pub async fn merge_only(
        &self,
        agent: &str,
        cache_type: &str,
        records: Vec<CacheRecord>,
    ) -> Result<MergeStats> {
        Ok(self
            .merger
            .merge_all(agent, cache_type, records)
            .await?
            .into_stats())
    }

    /// Out-of-band removal of specific records and every edge touching them
    pub async fn evict<I, S>(&self, cache_type: &str, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data.delete_batch(cache_type, ids).await
    }

    /// Drop every table under this namespace; returns the number of type tables dropped
    pub async fn reset(&self) -> Result<usize> {
        self.data.registry().reset().await
    }

    /// Cache types that have a table
    pub async fn types(&self) -> Result<Vec<String>> {
        self.data.registry().known_types().await
    }

    pub async fn stats(&self, cache_type: &str) -> Result<TypeStats> {
        self.data.stats(cache_type).await
    }
}

#[async_trait]
impl CacheReader for CacheEngine {
    async fn get(&self, cache_type: &str, id: &str) -> Result<Option<CacheRecord>> {
        self.data.get(cache_type, id).await
    }

    async fn get_all(&self, cache_type: &str, ids: &[String]) -> Result<Vec<CacheRecord>> {
        self.data.get_all(cache_type, ids.iter().cloned()).await
    }

    async fn filter_identifiers(&self, cache_type: &str, ids: &[String]) -> Result<BTreeSet<String>> {
        self.data
            .filter_identifiers(cache_type, ids.iter().cloned())
            .await
    }

    async fn related(
        &self,
        source: &RecordKey,
        relationship_type: Option<&str>,
    ) -> Result<Vec<CacheRecord>> {
        self.index.related(source, relationship_type).await
    }

    async fn referencing(&self, target: &RecordKey) -> Result<Vec<RelationshipEdge>> {
        self.index.incoming(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::testing::RecordingMetrics;
    use crate::metrics::{Operation, Outcome};
    use crate::CacheError;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::for_path(dir.path().join("cache.db"));
        config.store.pool_size = 2;
        config
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let err = CacheEngine::open(config(&dir).with_batch_sizes(0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert!(!dir.path().join("cache.db").exists());
    }

    #[tokio::test]
    async fn test_builder_overrides_collaborators() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(RecordingMetrics::default());
        let clock = Arc::new(ManualClock::at_millis(1_000));
        let engine = CacheEngine::builder(config(&dir))
            .metrics(metrics.clone())
            .clock(clock.clone())
            .open()
            .await
            .unwrap();

        engine
            .merge_all("k8s", "pods", vec![CacheRecord::new("pods", "web-0")])
            .await
            .unwrap();

        let pod = engine.get("pods", "web-0").await.unwrap().unwrap();
        assert_eq!(pod.last_written, Some(clock.now()));
        assert_eq!(metrics.count(Operation::Upsert, Outcome::Success), 1);
        assert_eq!(metrics.count(Operation::Evict, Outcome::Success), 1);
    }

    #[tokio::test]
    async fn test_round_outcome_reports_merge_and_eviction() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::open(config(&dir)).await.unwrap();
        let pods = |ids: &[&str]| -> Vec<CacheRecord> {
            ids.iter().map(|id| CacheRecord::new("pods", *id)).collect()
        };

        engine.merge_all("k8s", "pods", pods(&["a", "b"])).await.unwrap();
        let round = engine.merge_all("k8s", "pods", pods(&["b"])).await.unwrap();

        assert!(round.is_complete());
        assert_eq!(round.merge.written, 1);
        let eviction = round.eviction.unwrap();
        assert_eq!(eviction.evicted, BTreeSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn test_lookup_by_key() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::open(config(&dir)).await.unwrap();
        engine
            .merge_all("k8s", "pods", vec![CacheRecord::new("pods", "ns:web-0")])
            .await
            .unwrap();

        let pod = engine.lookup("pods:ns:web-0").await.unwrap().unwrap();
        assert_eq!(pod.id(), "ns:web-0");
        assert!(matches!(engine.lookup("pods").await, Err(CacheError::Key(_))));
    }

    #[tokio::test]
    async fn test_merge_only_never_evicts() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::open(config(&dir)).await.unwrap();

        engine
            .merge_all("k8s", "pods", vec![CacheRecord::new("pods", "a")])
            .await
            .unwrap();
        engine
            .merge_only("k8s", "pods", vec![CacheRecord::new("pods", "b")])
            .await
            .unwrap();

        let ids = engine.data().identifiers("pods").await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_and_types() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::open(config(&dir)).await.unwrap();
        engine
            .merge_all("k8s", "pods", vec![CacheRecord::new("pods", "a")])
            .await
            .unwrap();
        engine
            .merge_all("k8s", "nodes", vec![CacheRecord::new("nodes", "n")])
            .await
            .unwrap();

        assert_eq!(engine.types().await.unwrap(), vec!["nodes", "pods"]);
        assert_eq!(engine.reset().await.unwrap(), 2);
        assert!(engine.types().await.unwrap().is_empty());
        assert!(engine.get("pods", "a").await.unwrap().is_none());

        // Tables come back on the next merge
        engine
            .merge_all("k8s", "pods", vec![CacheRecord::new("pods", "a")])
            .await
            .unwrap();
        assert_eq!(engine.stats("pods").await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn test_engine_as_dyn_reader() {
        let dir = TempDir::new().unwrap();
        let engine = CacheEngine::open(config(&dir)).await.unwrap();
        let node = CacheRecord::new("nodes", "n1");
        let pod = CacheRecord::new("pods", "p1").relate_id("nodes", "n1");
        engine.merge_all("k8s", "nodes", vec![node]).await.unwrap();
        engine.merge_all("k8s", "pods", vec![pod]).await.unwrap();

        let reader: Arc<dyn CacheReader> = Arc::new(engine);
        let related = reader.related(&RecordKey::new("pods", "p1"), None).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id(), "n1");

        let referencing = reader.referencing(&RecordKey::new("nodes", "n1")).await.unwrap();
        assert_eq!(referencing.len(), 1);
        assert_eq!(referencing[0].source, RecordKey::new("pods", "p1"));
    }
}
