//! Derivation of track events from logs and their daily rollup.

use crate::model::{LogRow, TrackEvent, TrackEventDaily};
use std::collections::BTreeMap;

pub const TRACK_EVENT_LEVEL: &str = "event";

/// Logs with level `event`, a non-empty message and a distinct id become
/// track events named after the message.
///
/// Logs without an ingest id are skipped: they cannot be deduplicated, so
/// counting them would break replay idempotence.
pub fn track_events_from_logs(logs: &[LogRow]) -> Vec<TrackEvent> {
    logs.iter()
        .filter_map(|row| {
            if row.level.trim() != TRACK_EVENT_LEVEL {
                return None;
            }
            let name = row.message.trim();
            let distinct_id = row.distinct_id.trim();
            if name.is_empty() || distinct_id.is_empty() {
                return None;
            }
            Some(TrackEvent {
                project_id: row.project_id,
                timestamp: row.timestamp,
                ingest_id: row.ingest_id?,
                name: name.to_owned(),
                distinct_id: distinct_id.to_owned(),
                device_id: row.device_id.trim().to_owned(),
            })
        })
        .collect()
}

/// Groups events by (project, UTC day, name, distinct id) and counts them.
pub fn daily_rollup(events: &[TrackEvent]) -> Vec<TrackEventDaily> {
    let mut buckets: BTreeMap<_, i64> = BTreeMap::new();
    for event in events {
        let key = (
            event.project_id,
            event.day(),
            event.name.as_str(),
            event.distinct_id.as_str(),
        );
        *buckets.entry(key).or_default() += 1;
    }

    buckets
        .into_iter()
        .map(|((project_id, day, name, distinct_id), events)| TrackEventDaily {
            project_id,
            day,
            name: name.to_owned(),
            distinct_id: distinct_id.to_owned(),
            events,
        })
        .collect()
}
