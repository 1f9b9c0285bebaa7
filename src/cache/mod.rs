//! Persistent cache storage
//!
//! SQLite-backed typed records: one physical table per cache type, a shared
//! edge table for relationships and per-agent report state for eviction.

mod data_store;
mod relationships;
mod schema;
mod sqlite;

pub use data_store::{CacheDataStore, TypeStats};
pub use relationships::RelationshipIndex;
pub use schema::{SchemaRegistry, TableHandle};
pub use sqlite::{placeholders, quote_identifier, ConnectionPool, SqliteStore, TableNames};

#[cfg(test)]
pub(crate) use sqlite::testing;
