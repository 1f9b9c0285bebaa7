//! Stale-record eviction after a merge round
//!
//! Each `(agent, type)` pair moves through `Reporting -> Diffing -> Evicted`
//! once per round. The previous round's report lives in the store, so agents
//! in different processes see the same state.

use crate::cache::CacheDataStore;
use crate::merge::MergeReport;
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Where an `(agent, type)` pair is in its current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Reporting,
    Diffing,
    Evicted,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundPhase::Reporting => "reporting",
            RoundPhase::Diffing => "diffing",
            RoundPhase::Evicted => "evicted",
        };
        write!(f, "{name}")
    }
}

/// What one eviction pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Previously reported ids missing from this round's report
    pub stale: BTreeSet<String>,
    /// Stale ids actually deleted
    pub evicted: BTreeSet<String>,
    /// Stale ids not deleted: already gone, or (when eviction is limited to
    /// own writes) last written by another agent
    pub skipped: BTreeSet<String>,
}

type RoundKey = (String, String);

/// Diffs consecutive reports of an agent and deletes what it stopped reporting
pub struct EvictionCoordinator {
    data: Arc<CacheDataStore>,
    phases: Mutex<HashMap<RoundKey, RoundPhase>>,
    own_writes_only: bool,
}

impl EvictionCoordinator {
    pub fn new(data: Arc<CacheDataStore>) -> Self {
        Self {
            data,
            phases: Mutex::new(HashMap::new()),
            own_writes_only: false,
        }
    }

    /// Only delete stale ids whose last writer is the evicting agent
    ///
    /// Off by default: which agent reports an id is a convention between
    /// agents, and every stale id is deleted.
    pub fn with_own_writes_only(mut self, own_writes_only: bool) -> Self {
        self.own_writes_only = own_writes_only;
        self
    }

    pub fn own_writes_only(&self) -> bool {
        self.own_writes_only
    }

    /// Current phase of `(agent, cache_type)` in this process, if it ever ran
    pub fn phase(&self, agent: &str, cache_type: &str) -> Option<RoundPhase> {
        self.phases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(agent.to_string(), cache_type.to_string()))
            .copied()
    }

    /// Mark the start of a new round for `(agent, cache_type)`
    pub fn begin_round(&self, agent: &str, cache_type: &str) {
        self.set_phase(agent, cache_type, RoundPhase::Reporting);
    }

    fn set_phase(&self, agent: &str, cache_type: &str, phase: RoundPhase) {
        self.phases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((agent.to_string(), cache_type.to_string()), phase);
    }

    /// Ids the agent reported in its last completed round
    pub async fn reported_ids(&self, agent: &str, cache_type: &str) -> Result<BTreeSet<String>> {
        self.data.report_state(agent, cache_type).await
    }

    /// Remove records the agent reported last round but not in `report`
    ///
    /// Ids whose write failed this round count as still reported, so a
    /// failed write never turns into a delete. Deletion and the new report
    /// state commit in one transaction; on failure the previous state is
    /// kept and the next round recomputes the same diff.
    pub async fn evict_stale(&self, report: &MergeReport) -> Result<EvictionOutcome> {
        let (agent, cache_type) = (report.agent(), report.cache_type());
        self.set_phase(agent, cache_type, RoundPhase::Diffing);

        match self.diff_and_delete(report).await {
            Ok(outcome) => {
                self.set_phase(agent, cache_type, RoundPhase::Evicted);
                if !outcome.stale.is_empty() {
                    tracing::info!(
                        agent,
                        cache_type,
                        stale = outcome.stale.len(),
                        evicted = outcome.evicted.len(),
                        skipped = outcome.skipped.len(),
                        "Evicted stale records"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                self.set_phase(agent, cache_type, RoundPhase::Reporting);
                tracing::warn!(agent, cache_type, error = %e, "Eviction failed, report state kept");
                Err(e)
            }
        }
    }

    async fn diff_and_delete(&self, report: &MergeReport) -> Result<EvictionOutcome> {
        let (agent, cache_type) = (report.agent(), report.cache_type());
        let previous = self.data.report_state(agent, cache_type).await?;
        let failed = &report.stats().failed;

        let stale: BTreeSet<String> = previous.difference(report.reported()).cloned().collect();

        // A failed id stays tracked only if it was tracked before
        let mut next_state = report.written_ids();
        next_state.extend(failed.intersection(&previous).cloned());

        tracing::debug!(
            agent,
            cache_type,
            previous = previous.len(),
            current = report.reported().len(),
            stale = stale.len(),
            "Diffed report"
        );

        let evicted: BTreeSet<String> = self
            .data
            .evict(agent, cache_type, stale.clone(), next_state, self.own_writes_only)
            .await?
            .into_iter()
            .collect();
        let skipped = stale.difference(&evicted).cloned().collect();

        Ok(EvictionOutcome {
            stale,
            evicted,
            skipped,
        })
    }
}

impl fmt::Debug for EvictionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rounds = self.phases.lock().map(|p| p.len()).unwrap_or_default();
        f.debug_struct("EvictionCoordinator")
            .field("data", &self.data)
            .field("rounds", &rounds)
            .field("own_writes_only", &self.own_writes_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::open_store;
    use crate::cache::{RelationshipIndex, SchemaRegistry};
    use crate::merge::WriteMerger;
    use cache_record::{CacheRecord, RecordKey};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        data: Arc<CacheDataStore>,
        index: RelationshipIndex,
        merger: WriteMerger,
        eviction: EvictionCoordinator,
    }

    async fn fixture() -> Fixture {
        fixture_with(false).await
    }

    async fn fixture_with(own_writes_only: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir.path().join("cache.db"), ""));
        let registry = Arc::new(SchemaRegistry::open(Arc::clone(&store)).await.unwrap());
        let data = Arc::new(CacheDataStore::new(Arc::clone(&store), registry, 100));
        Fixture {
            _dir: dir,
            index: RelationshipIndex::new(store, Arc::clone(&data)),
            merger: WriteMerger::new(Arc::clone(&data), 2),
            eviction: EvictionCoordinator::new(Arc::clone(&data)).with_own_writes_only(own_writes_only),
            data,
        }
    }

    fn instances(ids: &[&str]) -> Vec<CacheRecord> {
        ids.iter().map(|id| CacheRecord::new("instances", *id)).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    impl Fixture {
        async fn round(&self, agent: &str, records: Vec<CacheRecord>) -> EvictionOutcome {
            self.eviction.begin_round(agent, "instances");
            let report = self.merger.merge_all(agent, "instances", records).await.unwrap();
            self.eviction.evict_stale(&report).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_round_evicts_nothing() {
        let f = fixture().await;
        let outcome = f.round("aws", instances(&["i-1", "i-2"])).await;

        assert!(outcome.stale.is_empty());
        assert_eq!(f.eviction.reported_ids("aws", "instances").await.unwrap(), set(&["i-1", "i-2"]));
        assert_eq!(f.eviction.phase("aws", "instances"), Some(RoundPhase::Evicted));
    }

    #[tokio::test]
    async fn test_dropped_id_is_evicted_with_its_edges() {
        let f = fixture().await;
        f.round("aws", instances(&["i-1", "i-2"])).await;

        // Another type points at i-1
        let volume = CacheRecord::new("volumes", "vol-1").relate("attached", RecordKey::new("instances", "i-1"));
        f.merger.merge_all("aws", "volumes", vec![volume]).await.unwrap();

        let outcome = f.round("aws", instances(&["i-2"])).await;
        assert_eq!(outcome.stale, set(&["i-1"]));
        assert_eq!(outcome.evicted, set(&["i-1"]));

        assert!(f.data.get("instances", "i-1").await.unwrap().is_none());
        assert!(f.index.incoming(&RecordKey::new("instances", "i-1")).await.unwrap().is_empty());
        assert_eq!(f.eviction.reported_ids("aws", "instances").await.unwrap(), set(&["i-2"]));
    }

    #[tokio::test]
    async fn test_failed_write_is_not_evicted() {
        let f = fixture().await;
        f.round("aws", instances(&["a", "b", "c"])).await;

        // "" and "a" share the failing first chunk
        let outcome = f.round("aws", instances(&["", "a", "c"])).await;
        assert_eq!(outcome.stale, set(&["b"]));
        assert!(f.data.get("instances", "a").await.unwrap().is_some());

        // "a" stays tracked, "" was never tracked so it is not added
        assert_eq!(f.eviction.reported_ids("aws", "instances").await.unwrap(), set(&["a", "c"]));
    }

    #[tokio::test]
    async fn test_handed_off_id_is_evicted_by_default() {
        let f = fixture().await;
        f.round("old-agent", instances(&["i-1", "i-2"])).await;
        f.round("new-agent", instances(&["i-1"])).await;

        let outcome = f.round("old-agent", instances(&["i-2"])).await;
        assert_eq!(outcome.stale, set(&["i-1"]));
        assert_eq!(outcome.evicted, set(&["i-1"]));
        assert!(outcome.skipped.is_empty());
        assert!(f.data.get("instances", "i-1").await.unwrap().is_none());

        // The new agent's next round writes it back
        f.round("new-agent", instances(&["i-1"])).await;
        assert!(f.data.get("instances", "i-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_own_writes_only_leaves_handed_off_id() {
        let f = fixture_with(true).await;
        f.round("old-agent", instances(&["i-1", "i-2"])).await;
        f.round("new-agent", instances(&["i-1"])).await;

        let outcome = f.round("old-agent", instances(&["i-2"])).await;
        assert_eq!(outcome.stale, set(&["i-1"]));
        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.skipped, set(&["i-1"]));

        let kept = f.data.get("instances", "i-1").await.unwrap().unwrap();
        assert_eq!(kept.writer_agent.as_deref(), Some("new-agent"));
        assert_eq!(f.eviction.reported_ids("old-agent", "instances").await.unwrap(), set(&["i-2"]));
    }

    #[tokio::test]
    async fn test_repeat_round_is_idempotent() {
        let f = fixture().await;
        f.round("aws", instances(&["i-1", "i-2"])).await;
        f.round("aws", instances(&["i-2"])).await;

        let again = f.round("aws", instances(&["i-2"])).await;
        assert!(again.stale.is_empty());
        assert_eq!(f.data.identifiers("instances").await.unwrap(), set(&["i-2"]));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RoundPhase::Diffing.to_string(), "diffing");
    }
}
