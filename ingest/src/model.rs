use crate::envelope::JsonObject;
use crate::identity;
use crate::message::LogPayload;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),
    #[error("log message is empty")]
    EmptyMessage,
    #[error("log timestamp is missing")]
    MissingTimestamp,
}

/// Project ids travel as strings and must be positive integers.
pub fn parse_project_id(raw: &str) -> Result<i64, ModelError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ModelError::InvalidProjectId(raw.to_owned())),
    }
}

/// Deterministic id for a string that is not itself a UUID.
pub fn stable_uuid(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::nil(), name.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRow {
    pub project_id: i64,
    pub timestamp: DateTime<Utc>,
    pub ingest_id: Option<Uuid>,
    pub level: String,
    pub distinct_id: String,
    pub device_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub message: String,
    pub fields: Value,
}

impl LogRow {
    pub fn from_payload(
        project_id: i64,
        payload: LogPayload,
        ingest_id: Option<Uuid>,
    ) -> Result<Self, ModelError> {
        if payload.message.trim().is_empty() {
            return Err(ModelError::EmptyMessage);
        }
        let timestamp = payload.timestamp.ok_or(ModelError::MissingTimestamp)?;

        let mut device_id = payload.device_id.trim().to_owned();
        let distinct_id = match identity::user_id(payload.user.as_ref()) {
            Some(user) => user,
            None if !device_id.is_empty() => device_id.clone(),
            None => {
                if let Some(id) = payload
                    .fields
                    .as_ref()
                    .and_then(|fields| fields.get("device_id"))
                    .and_then(Value::as_str)
                {
                    device_id = id.trim().to_owned();
                }
                device_id.clone()
            }
        };

        Ok(Self {
            project_id,
            timestamp,
            ingest_id,
            level: payload.level.trim().to_owned(),
            distinct_id,
            device_id,
            trace_id: payload.trace_id.trim().to_owned(),
            span_id: payload.span_id.trim().to_owned(),
            message: payload.message,
            fields: Value::Object(payload.fields.unwrap_or_default()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRow {
    pub id: Uuid,
    pub project_id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub distinct_id: String,
    pub device_id: String,
    pub os: String,
    pub platform: String,
    pub release_tag: String,
    pub environment: String,
    pub user_id: String,
    pub title: String,
    pub data: Value,
}

impl EventRow {
    /// Builds a row from a decoded event, normalising `event_id` in place.
    ///
    /// A missing id is replaced with `fallback_id`, which callers derive from
    /// the broker delivery so redeliveries map to the same row. An id that is
    /// not a UUID is replaced with a v5 UUID derived from it.
    pub fn from_event(
        project_id: i64,
        mut event: JsonObject,
        fallback_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let raw_id = event
            .get("event_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let id = match raw_id {
            Some(raw) => match Uuid::parse_str(&raw) {
                Ok(id) => id,
                Err(_) => {
                    let id = stable_uuid(&raw);
                    event.insert("event_id".into(), id.to_string().into());
                    id
                }
            },
            None => {
                event.insert("event_id".into(), fallback_id.to_string().into());
                fallback_id
            }
        };

        let text = |key: &str| {
            event
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        Self {
            id,
            project_id,
            timestamp: identity::timestamp(event.get("timestamp")).unwrap_or(now),
            level: text("level"),
            distinct_id: identity::distinct_id(&event).unwrap_or_default(),
            device_id: identity::device_id(&event).unwrap_or_default(),
            os: identity::os(&event).unwrap_or_default(),
            platform: text("platform"),
            release_tag: text("release"),
            environment: text("environment"),
            user_id: identity::user_id(event.get("user").and_then(Value::as_object))
                .unwrap_or_default(),
            title: identity::title(&event),
            data: Value::Object(event),
        }
    }
}

/// Analytics event derived from a log whose level is `event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackEvent {
    pub project_id: i64,
    pub timestamp: DateTime<Utc>,
    pub ingest_id: Uuid,
    pub name: String,
    pub distinct_id: String,
    pub device_id: String,
}

impl TrackEvent {
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackEventDaily {
    pub project_id: i64,
    pub day: NaiveDate,
    pub name: String,
    pub distinct_id: String,
    pub events: i64,
}
