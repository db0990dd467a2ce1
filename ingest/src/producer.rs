//! Turns accepted request bodies into broker messages.
//!
//! The HTTP layer authenticates the request and hands over the raw body;
//! everything from validation to the publish ack happens here.

use crate::broker::{BrokerError, Publisher};
use crate::envelope::{EnvelopeError, JsonObject, parse_envelope};
use crate::message::{
    BrokerMessage, EVENTS_TOPIC, LOGS_TOPIC, LogPayload, MessageKind, MessageMeta, Payload,
    RawEnvelope,
};
use crate::metrics_defs::PRODUCER_PUBLISH;
use crate::rollup::TRACK_EVENT_LEVEL;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::counter;
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(thiserror::Error, Debug)]
pub enum InvalidBody {
    #[error("body is empty")]
    Empty,
    #[error("array is empty")]
    EmptyArray,
    #[error("malformed json: {0}")]
    Json(#[source] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("item {0} has no message")]
    MissingMessage(usize),
    #[error("item {0} has no name")]
    MissingName(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("invalid body: {0}")]
    Invalid(#[from] InvalidBody),
    #[error("could not encode broker message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Request context shared by every message built from one body.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub project_id: String,
    pub received: DateTime<Utc>,
    pub meta: Option<MessageMeta>,
}

impl IngestRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            received: Utc::now(),
            meta: None,
        }
    }

    fn message(&self, payload: Payload) -> BrokerMessage {
        let mut message = BrokerMessage::new(self.project_id.clone(), self.received, payload);
        message.meta = self.meta.clone();
        message
    }
}

/// Analytics event as sent by SDKs. Published as a log with level `event`.
#[derive(Debug, Clone, Default, Deserialize)]
struct TrackEventPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: Option<JsonObject>,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    trace_id: String,
    #[serde(default)]
    span_id: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    extra: Option<JsonObject>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    user: Option<JsonObject>,
    #[serde(default)]
    sdk: Option<JsonObject>,
    #[serde(default)]
    contexts: Option<JsonObject>,
}

impl From<TrackEventPayload> for LogPayload {
    fn from(event: TrackEventPayload) -> Self {
        LogPayload {
            level: TRACK_EVENT_LEVEL.to_owned(),
            message: event.name.trim().to_owned(),
            device_id: event.device_id,
            trace_id: event.trace_id,
            span_id: event.span_id,
            fields: event.properties,
            timestamp: event.timestamp,
            extra: event.extra,
            tags: event.tags,
            user: event.user,
            sdk: event.sdk,
            contexts: event.contexts,
        }
    }
}

/// Accepts a single JSON value or a non-empty array of them.
fn decode_one_or_many<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>, InvalidBody> {
    let body = body.trim_ascii();
    if body.is_empty() {
        return Err(InvalidBody::Empty);
    }
    if body.starts_with(b"[") {
        let items: Vec<T> = serde_json::from_slice(body).map_err(InvalidBody::Json)?;
        if items.is_empty() {
            return Err(InvalidBody::EmptyArray);
        }
        return Ok(items);
    }
    let item = serde_json::from_slice(body).map_err(InvalidBody::Json)?;
    Ok(vec![item])
}

fn non_empty_event_id(object: &JsonObject) -> Option<String> {
    object
        .get("event_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

pub struct Producer<P> {
    publisher: P,
    events_topic: String,
    logs_topic: String,
}

impl<P: Publisher> Producer<P> {
    /// Publishes to the default `events` and `logs` topics.
    pub fn new(publisher: P) -> Self {
        Self::with_topics(publisher, EVENTS_TOPIC, LOGS_TOPIC)
    }

    /// Publishes to the topics the consumers are configured to read.
    pub fn with_topics(
        publisher: P,
        events_topic: impl Into<String>,
        logs_topic: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            events_topic: events_topic.into(),
            logs_topic: logs_topic.into(),
        }
    }

    pub fn topic(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Event | MessageKind::Envelope => &self.events_topic,
            MessageKind::Log => &self.logs_topic,
        }
    }

    /// Publishes a single event object and returns its event id.
    pub async fn publish_event(
        &self,
        request: &IngestRequest,
        body: &[u8],
    ) -> Result<String, PublishError> {
        let mut event: JsonObject = serde_json::from_slice(body).map_err(InvalidBody::Json)?;
        let event_id = match non_empty_event_id(&event) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                event.insert("event_id".into(), id.clone().into());
                id
            }
        };
        self.send(request.message(Payload::Event(event))).await?;
        Ok(event_id)
    }

    /// Publishes the first event item of an envelope, or the whole envelope
    /// verbatim when it has none. Returns the event id.
    pub async fn publish_envelope(
        &self,
        request: &IngestRequest,
        body: &[u8],
    ) -> Result<String, PublishError> {
        let envelope = parse_envelope(body).map_err(InvalidBody::from)?;
        let event_id = envelope
            .event_id()
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let payload = match envelope.first_event_json() {
            Some(mut event) => {
                if !matches!(event.get("event_id"), Some(Value::String(_))) {
                    event.insert("event_id".into(), event_id.clone().into());
                }
                Payload::Event(event)
            }
            None => Payload::Envelope(RawEnvelope {
                event_id: event_id.clone(),
                raw: String::from_utf8_lossy(body).into_owned(),
            }),
        };
        self.send(request.message(payload)).await?;
        Ok(event_id)
    }

    /// Publishes one log or an array of logs and returns how many were sent.
    ///
    /// The whole body is validated before anything is published.
    pub async fn publish_logs(
        &self,
        request: &IngestRequest,
        body: &[u8],
    ) -> Result<usize, PublishError> {
        let logs: Vec<LogPayload> = decode_one_or_many(body)?;
        if let Some(index) = logs.iter().position(|log| log.message.trim().is_empty()) {
            return Err(InvalidBody::MissingMessage(index).into());
        }
        self.send_logs(request, logs).await
    }

    /// Publishes one track event or an array of them as `event` logs.
    pub async fn publish_track(
        &self,
        request: &IngestRequest,
        body: &[u8],
    ) -> Result<usize, PublishError> {
        let events: Vec<TrackEventPayload> = decode_one_or_many(body)?;
        if let Some(index) = events.iter().position(|event| event.name.trim().is_empty()) {
            return Err(InvalidBody::MissingName(index).into());
        }
        self.send_logs(request, events.into_iter().map(LogPayload::from).collect())
            .await
    }

    async fn send_logs(
        &self,
        request: &IngestRequest,
        logs: Vec<LogPayload>,
    ) -> Result<usize, PublishError> {
        let count = logs.len();
        for mut log in logs {
            if log.level.trim().is_empty() {
                log.level = DEFAULT_LOG_LEVEL.to_owned();
            }
            log.timestamp.get_or_insert(request.received);
            let mut message = request.message(Payload::Log(log));
            message.ingest_id = Some(Uuid::new_v4());
            self.send(message).await?;
        }
        Ok(count)
    }

    async fn send(&self, message: BrokerMessage) -> Result<(), PublishError> {
        let topic = self.topic(message.kind());
        let body = message.encode().map_err(PublishError::Encode)?;
        let result = self.publisher.publish(topic, body).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        counter!(PRODUCER_PUBLISH, "topic" => topic.to_owned(), "status" => status).increment(1);
        Ok(result?)
    }
}
