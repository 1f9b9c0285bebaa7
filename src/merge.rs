//! Chunked merge of an agent's reported records
//!
//! A merge is chunk-atomic, not batch-atomic: every chunk commits (or fails)
//! on its own, and a failed chunk never stops the ones after it. Failed ids
//! come back in [`MergeStats`] so the agent can resubmit them next round.
//!
//! Dropping a running merge future cancels it between chunks. Chunks that
//! already committed stay committed; a chunk already handed to the blocking
//! pool finishes its transaction.

use crate::cache::CacheDataStore;
use crate::{CacheError, Result};
use cache_record::{CacheRecord, RecordKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// One chunk that failed after exhausting retries (or failed permanently)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub first_id: String,
    pub last_id: String,
    pub size: usize,
    pub error: String,
    /// Attempts made, when the failure was a transient one that ran out of retries
    pub attempts: Option<u32>,
}

/// Result of one merge call
///
/// A non-empty `failed` set is the partial-merge outcome: the ids listed
/// were not written this round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub written: usize,
    pub failed: BTreeSet<String>,
    pub chunk_failures: Vec<ChunkFailure>,
    /// Records dropped before any chunk because they name another cache type
    pub rejected: Vec<RecordKey>,
    pub chunks: usize,
}

impl MergeStats {
    /// Some ids were not written
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected.is_empty()
    }
}

/// A completed merge round, the input eviction diffs against
///
/// Only [`WriteMerger::merge_all`] produces one, so eviction for a round
/// cannot run before that round's merge has finished.
#[derive(Debug, Clone)]
pub struct MergeReport {
    agent: String,
    cache_type: String,
    reported: BTreeSet<String>,
    stats: MergeStats,
}

impl MergeReport {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    /// Every id the agent reported this round, written or not
    pub fn reported(&self) -> &BTreeSet<String> {
        &self.reported
    }

    /// Ids reported and actually written
    pub fn written_ids(&self) -> BTreeSet<String> {
        self.reported.difference(&self.stats.failed).cloned().collect()
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    pub fn into_stats(self) -> MergeStats {
        self.stats
    }
}

/// Splits merges into bounded transactions
#[derive(Debug, Clone)]
pub struct WriteMerger {
    data: Arc<CacheDataStore>,
    batch_size: usize,
    pacing: Option<Duration>,
}

impl WriteMerger {
    pub fn new(data: Arc<CacheDataStore>, batch_size: usize) -> Self {
        Self {
            data,
            batch_size: batch_size.max(1),
            pacing: None,
        }
    }

    /// Pause this long between consecutive chunks
    pub fn with_pacing(mut self, pacing: Option<Duration>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Commit `records` as `agent`'s complete view of `cache_type`
    ///
    /// Records are deduplicated by id (last occurrence wins), sorted, and
    /// written in chunks of the configured batch size, each chunk one
    /// retried transaction.
    ///
    /// # Errors
    /// Only a schema creation failure for `cache_type` is returned as an
    /// error. Chunk failures are reported in [`MergeStats`].
    pub async fn merge_all(
        &self,
        agent: &str,
        cache_type: &str,
        records: Vec<CacheRecord>,
    ) -> Result<MergeReport> {
        let started = Instant::now();
        let mut stats = MergeStats::default();

        let mut by_id: BTreeMap<String, CacheRecord> = BTreeMap::new();
        for record in records {
            if record.cache_type() != cache_type {
                tracing::warn!(
                    agent,
                    cache_type,
                    key = %record.key,
                    "Rejecting record of another cache type"
                );
                stats.rejected.push(record.key);
                continue;
            }
            by_id.insert(record.id().to_string(), record);
        }

        let reported: BTreeSet<String> = by_id.keys().cloned().collect();
        let ordered: Vec<CacheRecord> = by_id.into_values().collect();

        if !ordered.is_empty() {
            self.data.registry().ensure_table(cache_type).await?;
        }

        for (index, chunk) in ordered.chunks(self.batch_size).enumerate() {
            if index > 0 {
                if let Some(pause) = self.pacing {
                    sleep(pause).await;
                }
            }
            stats.chunks += 1;

            match self.data.upsert_batch(agent, cache_type, chunk.to_vec()).await {
                Ok(written) => {
                    stats.written += written;
                    tracing::debug!(agent, cache_type, chunk = index, written, "Merged chunk");
                }
                Err(e) => {
                    let failure = chunk_failure(chunk, &e);
                    tracing::warn!(
                        agent,
                        cache_type,
                        chunk = index,
                        first_id = %failure.first_id,
                        last_id = %failure.last_id,
                        error = %e,
                        "Chunk failed, continuing with remaining chunks"
                    );
                    stats.failed.extend(chunk.iter().map(|r| r.id().to_string()));
                    stats.chunk_failures.push(failure);
                }
            }
        }

        tracing::info!(
            agent,
            cache_type,
            reported = reported.len(),
            written = stats.written,
            failed = stats.failed.len(),
            chunks = stats.chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Merge round complete"
        );

        Ok(MergeReport {
            agent: agent.to_string(),
            cache_type: cache_type.to_string(),
            reported,
            stats,
        })
    }
}

fn chunk_failure(chunk: &[CacheRecord], error: &CacheError) -> ChunkFailure {
    let id_at = |record: Option<&CacheRecord>| record.map(|r| r.id().to_string()).unwrap_or_default();
    ChunkFailure {
        first_id: id_at(chunk.first()),
        last_id: id_at(chunk.last()),
        size: chunk.len(),
        error: error.to_string(),
        attempts: error.attempts(),
    }
}
