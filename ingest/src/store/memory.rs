use super::{PersistStats, Store, StoreError, record_stats};
use crate::model::{EventRow, LogRow, TrackEvent, TrackEventDaily};
use crate::rollup::{daily_rollup, track_events_from_logs};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type DailyKey = (i64, NaiveDate, String, String);

#[derive(Default)]
struct Tables {
    available: bool,
    events: HashMap<Uuid, EventRow>,
    logs: Vec<LogRow>,
    log_keys: HashSet<(i64, Uuid)>,
    track_events: Vec<TrackEvent>,
    track_event_keys: HashSet<(i64, Uuid)>,
    daily: BTreeMap<DailyKey, i64>,
}

/// Keeps every table in memory behind one lock, with the same conflict rules
/// as the Postgres schema.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                available: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unavailable, every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn events(&self) -> Vec<EventRow> {
        let mut events: Vec<_> = self.lock().events.values().cloned().collect();
        events.sort_by_key(|row| (row.timestamp, row.id));
        events
    }

    pub fn logs(&self) -> Vec<LogRow> {
        self.lock().logs.clone()
    }

    pub fn track_events(&self) -> Vec<TrackEvent> {
        self.lock().track_events.clone()
    }

    pub fn daily(&self) -> Vec<TrackEventDaily> {
        self.lock()
            .daily
            .iter()
            .map(|((project_id, day, name, distinct_id), events)| TrackEventDaily {
                project_id: *project_id,
                day: *day,
                name: name.clone(),
                distinct_id: distinct_id.clone(),
                events: *events,
            })
            .collect()
    }

    fn check(tables: &Tables) -> Result<(), StoreError> {
        if tables.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Self::check(&self.lock())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Self::check(&self.lock())
    }

    async fn insert_events(&self, rows: &[EventRow]) -> Result<PersistStats, StoreError> {
        let mut tables = self.lock();
        Self::check(&tables)?;
        let mut stats = PersistStats::default();
        for row in rows {
            if !tables.events.contains_key(&row.id) {
                tables.events.insert(row.id, row.clone());
                stats.inserted += 1;
            }
        }
        drop(tables);

        record_stats("events", rows.len(), &stats);
        Ok(stats)
    }

    async fn insert_logs(&self, rows: &[LogRow]) -> Result<PersistStats, StoreError> {
        let mut tables = self.lock();
        Self::check(&tables)?;
        let mut stats = PersistStats::default();
        for row in rows {
            // Rows without an ingest id never conflict, like NULLs in a unique index.
            let is_new = match row.ingest_id {
                Some(id) => tables.log_keys.insert((row.project_id, id)),
                None => true,
            };
            if is_new {
                tables.logs.push(row.clone());
                stats.inserted += 1;
            }
        }

        let new_events: Vec<TrackEvent> = track_events_from_logs(rows)
            .into_iter()
            .filter(|event| {
                tables
                    .track_event_keys
                    .insert((event.project_id, event.ingest_id))
            })
            .collect();
        for daily in daily_rollup(&new_events) {
            *tables
                .daily
                .entry((daily.project_id, daily.day, daily.name, daily.distinct_id))
                .or_default() += daily.events;
        }
        stats.track_events = new_events.len() as u64;
        tables.track_events.extend(new_events);
        drop(tables);

        record_stats("logs", rows.len(), &stats);
        Ok(stats)
    }
}
