//! Topic handlers: decode a broker message, build its row and wait for the
//! batch holding it to be persisted.
//!
//! Input that can never be stored is acknowledged and dropped. Only
//! persistence failures are returned as errors, which requeues the message.

use crate::batcher::{BatchError, Batcher, BatcherConfig};
use crate::broker::DeliveryInfo;
use crate::consumer::MessageHandler;
use crate::message::{BrokerMessage, Payload};
use crate::metrics_defs::CONSUMER_DROPPED;
use crate::model::{EventRow, LogRow, parse_project_id, stable_uuid};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use shared::counter;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

pub type EventBatcher = Batcher<EventRow, StoreError>;
pub type LogBatcher = Batcher<LogRow, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("could not persist message: {0}")]
    Persist(#[from] BatchError<StoreError>),
}

pub fn event_batcher(store: Arc<dyn Store>, config: BatcherConfig) -> EventBatcher {
    Batcher::new("events", config, move |rows: Vec<EventRow>| {
        let store = store.clone();
        async move {
            let stats = store.insert_events(&rows).await?;
            debug!(offered = rows.len(), inserted = stats.inserted, "events flushed");
            Ok::<_, StoreError>(())
        }
    })
}

pub fn log_batcher(store: Arc<dyn Store>, config: BatcherConfig) -> LogBatcher {
    Batcher::new("logs", config, move |rows: Vec<LogRow>| {
        let store = store.clone();
        async move {
            let stats = store.insert_logs(&rows).await?;
            debug!(
                offered = rows.len(),
                inserted = stats.inserted,
                track_events = stats.track_events,
                "logs flushed"
            );
            Ok::<_, StoreError>(())
        }
    })
}

fn dropped(topic: &str, info: &DeliveryInfo, reason: &'static str, detail: impl Display) {
    warn!(topic, id = %info.id, reason, detail = %detail, "dropping message");
    counter!(CONSUMER_DROPPED, "topic" => topic.to_owned(), "reason" => reason).increment(1);
}

/// Decodes the message and validates its project id, or drops it.
fn decode(topic: &str, body: &[u8], info: &DeliveryInfo) -> Option<(i64, BrokerMessage)> {
    let message = match BrokerMessage::decode(body) {
        Ok(message) => message,
        Err(e) => {
            dropped(topic, info, e.reason(), &e);
            return None;
        }
    };
    match parse_project_id(&message.project_id) {
        Ok(project_id) => Some((project_id, message)),
        Err(e) => {
            dropped(topic, info, "invalid_project", &e);
            None
        }
    }
}

/// Stores `event` and `envelope` messages as events.
pub struct EventHandler {
    topic: String,
    batcher: Arc<EventBatcher>,
}

impl EventHandler {
    pub fn new(topic: impl Into<String>, batcher: Arc<EventBatcher>) -> Self {
        Self {
            topic: topic.into(),
            batcher,
        }
    }
}

#[async_trait]
impl MessageHandler for EventHandler {
    type Error = HandlerError;

    async fn handle(&self, body: &[u8], info: &DeliveryInfo) -> Result<(), HandlerError> {
        let Some((project_id, message)) = decode(&self.topic, body, info) else {
            return Ok(());
        };
        let kind = message.kind();
        let event = match message.payload {
            Payload::Event(event) => event,
            Payload::Envelope(envelope) => envelope.into_event(),
            Payload::Log(_) => {
                dropped(&self.topic, info, "unexpected_kind", kind);
                return Ok(());
            }
        };

        // Redeliveries of an event without an id keep the same id.
        let row = EventRow::from_event(project_id, event, stable_uuid(&info.id), Utc::now());
        self.batcher.add(row).await?;
        Ok(())
    }
}

/// Stores `log` messages; track events are derived when the batch is written.
pub struct LogHandler {
    topic: String,
    batcher: Arc<LogBatcher>,
}

impl LogHandler {
    pub fn new(topic: impl Into<String>, batcher: Arc<LogBatcher>) -> Self {
        Self {
            topic: topic.into(),
            batcher,
        }
    }
}

#[async_trait]
impl MessageHandler for LogHandler {
    type Error = HandlerError;

    async fn handle(&self, body: &[u8], info: &DeliveryInfo) -> Result<(), HandlerError> {
        let Some((project_id, message)) = decode(&self.topic, body, info) else {
            return Ok(());
        };
        let kind = message.kind();
        let Payload::Log(mut payload) = message.payload else {
            dropped(&self.topic, info, "unexpected_kind", kind);
            return Ok(());
        };
        payload.timestamp.get_or_insert(message.received);
        // Redeliveries of a message without a stamped id keep the same id.
        let ingest_id = message.ingest_id.unwrap_or_else(|| stable_uuid(&info.id));

        let row = match LogRow::from_payload(project_id, payload, Some(ingest_id)) {
            Ok(row) => row,
            Err(e) => {
                dropped(&self.topic, info, "invalid_log", &e);
                return Ok(());
            }
        };
        self.batcher.add(row).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{Value, json};
    use uuid::Uuid;

    fn immediate() -> BatcherConfig {
        BatcherConfig {
            max_size: 1,
            ..Default::default()
        }
    }

    fn info(id: &str) -> DeliveryInfo {
        DeliveryInfo {
            id: id.to_owned(),
            attempt: 1,
        }
    }

    fn body(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    fn event_handler() -> (EventHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let batcher = event_batcher(store.clone(), immediate());
        (EventHandler::new("events", Arc::new(batcher)), store)
    }

    fn log_handler() -> (LogHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let batcher = log_batcher(store.clone(), immediate());
        (LogHandler::new("logs", Arc::new(batcher)), store)
    }

    #[tokio::test]
    async fn stores_event_message() {
        let (handler, store) = event_handler();
        let msg = body(json!({
            "type": "event",
            "project_id": "3",
            "payload": {"event_id": "e1", "message": "boom", "level": "error"},
        }));
        handler.handle(&msg, &info("EVENTS:1")).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].project_id, 3);
        assert_eq!(events[0].id, stable_uuid("e1"));
        assert_eq!(events[0].title, "boom");

        // Redelivery is absorbed by the store.
        handler.handle(&msg, &info("EVENTS:1")).await.unwrap();
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn event_without_id_is_stored_once_across_redeliveries() {
        let (handler, store) = event_handler();
        let msg = body(json!({
            "type": "event",
            "project_id": "3",
            "payload": {"message": "boom"},
        }));
        handler.handle(&msg, &info("EVENTS:42")).await.unwrap();
        handler.handle(&msg, &info("EVENTS:42")).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, stable_uuid("EVENTS:42"));
        assert_eq!(events[0].data["event_id"], json!(events[0].id.to_string()));
    }

    #[tokio::test]
    async fn stores_raw_envelope_as_event() {
        let (handler, store) = event_handler();
        let id = Uuid::new_v4();
        let msg = body(json!({
            "type": "envelope",
            "project_id": "3",
            "payload": {"event_id": id.to_string(), "raw": "{}\n{\"type\":\"attachment\"}\n"},
        }));
        handler.handle(&msg, &info("EVENTS:2")).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].data["raw"], json!("{}\n{\"type\":\"attachment\"}\n"));
    }

    #[tokio::test]
    async fn drops_unusable_messages() {
        let (handler, store) = event_handler();
        let bodies = [
            b"not json".to_vec(),
            body(json!({"type": "metric", "project_id": "3", "payload": {}})),
            body(json!({"type": "event", "project_id": "abc", "payload": {}})),
            body(json!({"type": "event", "project_id": "0", "payload": {}})),
            body(json!({"type": "event", "project_id": "3", "payload": [1, 2]})),
            body(json!({"type": "log", "project_id": "3", "payload": {"message": "x"}})),
        ];
        for (i, msg) in bodies.iter().enumerate() {
            let result = handler.handle(msg, &info(&format!("EVENTS:{i}"))).await;
            assert!(result.is_ok(), "body {i} should be acknowledged");
        }
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn store_failure_requeues() {
        let (handler, store) = event_handler();
        store.set_available(false);
        let msg = body(json!({"type": "event", "project_id": "3", "payload": {}}));
        let err = handler.handle(&msg, &info("EVENTS:1")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Persist(BatchError::Flush(_))));
    }

    #[tokio::test]
    async fn log_ingest_id_falls_back_to_delivery_id() {
        let (handler, store) = log_handler();
        let msg = body(json!({
            "type": "log",
            "project_id": "1",
            "received": "2024-05-01T10:00:00Z",
            "payload": {"level": "event", "message": "signup", "user": {"id": "u1"}},
        }));
        handler.handle(&msg, &info("LOGS:9")).await.unwrap();
        handler.handle(&msg, &info("LOGS:9")).await.unwrap();

        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ingest_id, Some(stable_uuid("LOGS:9")));
        assert_eq!(logs[0].timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(store.track_events().len(), 1);
        assert_eq!(store.daily()[0].events, 1);
    }

    #[tokio::test]
    async fn log_uses_stamped_ingest_id() {
        let (handler, store) = log_handler();
        let id = Uuid::new_v4();
        let msg = body(json!({
            "type": "log",
            "project_id": "1",
            "ingest_id": id,
            "payload": {
                "level": "info",
                "message": "hello",
                "timestamp": "2024-05-01T09:00:00Z",
            },
        }));
        handler.handle(&msg, &info("LOGS:1")).await.unwrap();
        // A republished copy under a new delivery id is still the same log.
        handler.handle(&msg, &info("LOGS:2")).await.unwrap();

        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ingest_id, Some(id));
        assert_eq!(logs[0].timestamp.to_rfc3339(), "2024-05-01T09:00:00+00:00");
        assert!(store.track_events().is_empty());
    }

    #[tokio::test]
    async fn drops_empty_log_message() {
        let (handler, store) = log_handler();
        let msg = body(json!({
            "type": "log",
            "project_id": "1",
            "payload": {"level": "info", "message": "   "},
        }));
        handler.handle(&msg, &info("LOGS:1")).await.unwrap();
        assert!(store.logs().is_empty());
    }
}
