//! Idempotent persistence of event and log rows.
//!
//! Inserts ignore rows whose key already exists, so replaying a batch after a
//! partial failure or a redelivery never duplicates rows. Log batches also
//! record their track events and fold the newly inserted ones into the daily
//! rollup, all in one transaction.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::metrics_defs::{STORE_ROWS_OFFERED, STORE_TRACK_EVENTS_NEW};
use crate::model::{EventRow, LogRow};
use async_trait::async_trait;
use shared::counter;
use std::sync::Arc;

pub const MEMORY_URL: &str = "memory://";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("could not get a connection from the pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("could not create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("could not encode rows: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store unavailable")]
    Unavailable,
}

/// What a single insert call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// Rows that did not exist before.
    pub inserted: u64,
    /// Newly inserted track events, each counted once in the daily rollup.
    pub track_events: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Creates missing tables and indexes.
    async fn migrate(&self) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_events(&self, rows: &[EventRow]) -> Result<PersistStats, StoreError>;

    async fn insert_logs(&self, rows: &[LogRow]) -> Result<PersistStats, StoreError>;
}

/// Opens the store named by `url`; [`MEMORY_URL`] selects the in-memory store.
pub fn open(url: &str, max_connections: usize) -> Result<Arc<dyn Store>, StoreError> {
    if url == MEMORY_URL {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(PostgresStore::new(url, max_connections)?))
}

fn record_stats(table: &'static str, offered: usize, stats: &PersistStats) {
    counter!(STORE_ROWS_OFFERED, "table" => table).increment(offered as u64);
    if stats.track_events > 0 {
        counter!(STORE_TRACK_EVENTS_NEW).increment(stats.track_events);
    }
}
