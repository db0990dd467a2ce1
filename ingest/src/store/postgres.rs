use super::{PersistStats, Store, StoreError, record_stats};
use crate::model::{EventRow, LogRow};
use crate::rollup::track_events_from_logs;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::types::Json;
use tracing::{debug, info};

/// Rows per insert statement.
const CHUNK_SIZE: usize = 200;

const SCHEMA: &str = include_str!("schema.sql");

const INSERT_EVENTS: &str = "
    INSERT INTO events (id, project_id, timestamp, level, distinct_id, device_id, os,
                        platform, release_tag, environment, user_id, title, data)
    SELECT id, project_id, timestamp, level, distinct_id, device_id, os,
           platform, release_tag, environment, user_id, title, data
    FROM jsonb_to_recordset($1::jsonb) AS r(
        id uuid, project_id bigint, timestamp timestamptz, level text, distinct_id text,
        device_id text, os text, platform text, release_tag text, environment text,
        user_id text, title text, data jsonb
    )
    ON CONFLICT DO NOTHING";

const INSERT_LOGS: &str = "
    INSERT INTO logs (project_id, timestamp, ingest_id, level, distinct_id, device_id,
                      trace_id, span_id, message, fields)
    SELECT project_id, timestamp, ingest_id, level, distinct_id, device_id,
           trace_id, span_id, message, fields
    FROM jsonb_to_recordset($1::jsonb) AS r(
        project_id bigint, timestamp timestamptz, ingest_id uuid, level text,
        distinct_id text, device_id text, trace_id text, span_id text, message text,
        fields jsonb
    )
    ON CONFLICT DO NOTHING";

// Only rows that were actually inserted reach the rollup, so a replayed batch
// leaves the daily counts unchanged.
const INSERT_TRACK_EVENTS: &str = "
    WITH input AS (
        SELECT * FROM jsonb_to_recordset($1::jsonb) AS t(
            project_id bigint, timestamp timestamptz, ingest_id uuid, name text,
            distinct_id text, device_id text
        )
    ),
    ins AS (
        INSERT INTO track_events (project_id, timestamp, ingest_id, name, distinct_id, device_id)
        SELECT project_id, timestamp, ingest_id, name, distinct_id, device_id FROM input
        ON CONFLICT (project_id, ingest_id) DO NOTHING
        RETURNING project_id, timestamp, name, distinct_id
    ),
    agg AS (
        SELECT project_id, (timestamp AT TIME ZONE 'UTC')::date AS day, name, distinct_id,
               COUNT(*)::bigint AS events
        FROM ins
        GROUP BY 1, 2, 3, 4
    ),
    upsert AS (
        INSERT INTO track_event_daily (project_id, day, name, distinct_id, events, created_at, updated_at)
        SELECT project_id, day, name, distinct_id, events, NOW(), NOW() FROM agg
        ON CONFLICT (project_id, day, name, distinct_id) DO UPDATE
        SET events = track_event_daily.events + EXCLUDED.events,
            updated_at = NOW()
    )
    SELECT COALESCE(SUM(events), 0)::bigint FROM agg";

/// Postgres store over a deadpool connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Builds the pool. No connection is made until first use.
    pub fn new(url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let mut config = Config::new();
        config.url = Some(url.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig::new(max_connections.max(1)));

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("postgres schema is up to date");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgres connection successful");
        Ok(())
    }

    async fn insert_events(&self, rows: &[EventRow]) -> Result<PersistStats, StoreError> {
        if rows.is_empty() {
            return Ok(PersistStats::default());
        }
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut stats = PersistStats::default();
        for chunk in rows.chunks(CHUNK_SIZE) {
            stats.inserted += tx.execute(INSERT_EVENTS, &[&Json(chunk)]).await?;
        }
        tx.commit().await?;

        record_stats("events", rows.len(), &stats);
        Ok(stats)
    }

    async fn insert_logs(&self, rows: &[LogRow]) -> Result<PersistStats, StoreError> {
        if rows.is_empty() {
            return Ok(PersistStats::default());
        }
        let track_events = track_events_from_logs(rows);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut stats = PersistStats::default();
        for chunk in rows.chunks(CHUNK_SIZE) {
            stats.inserted += tx.execute(INSERT_LOGS, &[&Json(chunk)]).await?;
        }
        for chunk in track_events.chunks(CHUNK_SIZE) {
            let row = tx.query_one(INSERT_TRACK_EVENTS, &[&Json(chunk)]).await?;
            let new: i64 = row.try_get(0)?;
            stats.track_events += new as u64;
        }
        tx.commit().await?;

        record_stats("logs", rows.len(), &stats);
        Ok(stats)
    }
}
