//! cachegraph - typed, relationship-aware cache over SQLite
//!
//! Many independently scheduled collection agents publish their observed
//! state into one shared store; readers query records by type and id and
//! follow relationships one hop.
//!
//! # Architecture
//!
//! - **cache**: SQLite store, per-type schema registry, record CRUD, edges
//! - **merge**: chunked, retried merges of an agent's reported records
//! - **eviction**: per-(agent, type) report diffing and stale record removal
//! - **retry**: transient/permanent failure classification and backoff
//! - **metrics**: pluggable observation sink (no-op or Prometheus)
//! - **clock**: injectable time source
//! - **config**: YAML engine configuration and validation
//! - **engine**: the [`CacheEngine`] facade and [`CacheReader`] implementation
//!
//! # Example
//!
//! ```no_run
//! use cachegraph::{CacheEngine, CacheReader, CacheRecord, EngineConfig};
//!
//! # async fn run() -> cachegraph::Result<()> {
//! let engine = CacheEngine::open(EngineConfig::for_path("/tmp/cache.db")).await?;
//! let subnet = CacheRecord::new("subnets", "subnet-1")
//!     .with_attribute("cidr", "10.0.1.0/24")
//!     .relate_id("vpcs", "vpc-1");
//!
//! let round = engine.merge_all("aws-network", "subnets", vec![subnet]).await?;
//! assert!(round.is_complete());
//!
//! let stored = engine.get("subnets", "subnet-1").await?;
//! assert!(stored.is_some());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod reader;
pub mod retry;

// Re-exports
pub use cache_record::{CacheRecord, KeyParseError, RecordKey, RelationshipEdge};
pub use config::EngineConfig;
pub use engine::{CacheEngine, EngineBuilder, RoundOutcome};
pub use error::{CacheError, Result};
pub use merge::MergeStats;
pub use reader::CacheReader;
