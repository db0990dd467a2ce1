//! The broker message schema shared by producers and consumers.

use crate::envelope::JsonObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const EVENTS_TOPIC: &str = "events";
pub const LOGS_TOPIC: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Envelope,
    Log,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(MessageKind::Event),
            "envelope" => Some(MessageKind::Envelope),
            "log" => Some(MessageKind::Log),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::Envelope => "envelope",
            MessageKind::Log => "log",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

/// An envelope that carried no decodable event item, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub event_id: String,
    pub raw: String,
}

impl RawEnvelope {
    /// The object stored as the event's data.
    pub fn into_event(self) -> JsonObject {
        let mut event = JsonObject::new();
        event.insert("event_id".into(), self.event_id.into());
        event.insert("raw".into(), self.raw.into());
        event
    }
}

/// A structured log line as sent by SDKs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<JsonObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(JsonObject),
    Envelope(RawEnvelope),
    Log(LogPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Event(_) => MessageKind::Event,
            Payload::Envelope(_) => MessageKind::Envelope,
            Payload::Log(_) => MessageKind::Log,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub project_id: String,
    pub received: DateTime<Utc>,
    pub meta: Option<MessageMeta>,
    /// Idempotency key stamped by the producer. Consumers fall back to one
    /// derived from the broker's delivery id.
    pub ingest_id: Option<Uuid>,
    pub payload: Payload,
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed broker message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Short label for logs and metric tags.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnknownKind(_) => "unknown_kind",
            DecodeError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    project_id: String,
    #[serde(default = "Utc::now")]
    received: DateTime<Utc>,
    payload: Box<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<MessageMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ingest_id: Option<Uuid>,
}

impl BrokerMessage {
    pub fn new(project_id: impl Into<String>, received: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            project_id: project_id.into(),
            received,
            meta: None,
            ingest_id: None,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;
        let kind = MessageKind::parse(&wire.kind).ok_or(DecodeError::UnknownKind(wire.kind))?;
        let raw = wire.payload.get();
        let invalid = |source: serde_json::Error| DecodeError::InvalidPayload { kind, source };

        let payload = match kind {
            MessageKind::Event => Payload::Event(serde_json::from_str(raw).map_err(invalid)?),
            MessageKind::Envelope => Payload::Envelope(serde_json::from_str(raw).map_err(invalid)?),
            MessageKind::Log => Payload::Log(serde_json::from_str(raw).map_err(invalid)?),
        };

        Ok(Self {
            project_id: wire.project_id,
            received: wire.received,
            meta: wire.meta,
            ingest_id: wire.ingest_id,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = match &self.payload {
            Payload::Event(event) => serde_json::value::to_raw_value(event)?,
            Payload::Envelope(envelope) => serde_json::value::to_raw_value(envelope)?,
            Payload::Log(log) => serde_json::value::to_raw_value(log)?,
        };
        let wire = WireMessage {
            kind: self.kind().as_str().to_owned(),
            project_id: self.project_id.clone(),
            received: self.received,
            payload,
            meta: self.meta.clone(),
            ingest_id: self.ingest_id,
        };
        serde_json::to_vec(&wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_event_message() {
        let body = br#"{"type":"event","project_id":"7","received":"2024-05-01T10:00:00Z",
            "payload":{"event_id":"e1","message":"boom"},
            "meta":{"client_ip":"10.0.0.1","user_agent":"sdk/1.0"}}"#;
        let msg = BrokerMessage::decode(body).unwrap();
        assert_eq!(msg.kind(), MessageKind::Event);
        assert_eq!(msg.project_id, "7");
        assert_eq!(msg.received.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(msg.meta.as_ref().unwrap().client_ip, "10.0.0.1");
        let Payload::Event(event) = msg.payload else {
            panic!("expected event payload");
        };
        assert_eq!(event.get("message"), Some(&json!("boom")));
    }

    #[test]
    fn decodes_log_message_with_ingest_id() {
        let id = Uuid::new_v4();
        let body = json!({
            "type": "log",
            "project_id": "1",
            "received": "2024-05-01T10:00:00Z",
            "ingest_id": id,
            "payload": {"level": "event", "message": "signup", "user": {"id": "u1"}},
        })
        .to_string();
        let msg = BrokerMessage::decode(body.as_bytes()).unwrap();
        assert_eq!(msg.ingest_id, Some(id));
        assert!(msg.meta.is_none());
        let Payload::Log(log) = msg.payload else {
            panic!("expected log payload");
        };
        assert_eq!(log.level, "event");
        assert_eq!(log.message, "signup");
        assert!(log.timestamp.is_none());
    }

    #[test]
    fn unknown_kind_is_reported_separately() {
        let body = br#"{"type":"session","project_id":"1","payload":{}}"#;
        let err = BrokerMessage::decode(body).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(ref k) if k == "session"));
        assert_eq!(err.reason(), "unknown_kind");
    }

    #[test]
    fn malformed_messages() {
        assert!(matches!(
            BrokerMessage::decode(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            BrokerMessage::decode(br#"{"type":"event","project_id":1,"payload":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            BrokerMessage::decode(br#"{"type":"event","project_id":"1","payload":[1,2]}"#),
            Err(DecodeError::InvalidPayload {
                kind: MessageKind::Event,
                ..
            })
        ));
        assert!(matches!(
            BrokerMessage::decode(br#"{"type":"log","project_id":"1","payload":{"message":5}}"#),
            Err(DecodeError::InvalidPayload {
                kind: MessageKind::Log,
                ..
            })
        ));
    }

    #[test]
    fn encode_then_decode_keeps_fields() {
        let received = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut msg = BrokerMessage::new(
            "3",
            received,
            Payload::Envelope(RawEnvelope {
                event_id: "abc".into(),
                raw: "{}\n{\"type\":\"session\"}\n{}\n".into(),
            }),
        );
        msg.meta = Some(MessageMeta {
            client_ip: "127.0.0.1".into(),
            user_agent: String::new(),
        });

        let body = msg.encode().unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(wire["type"], "envelope");
        assert_eq!(wire["meta"], json!({"client_ip": "127.0.0.1"}));
        assert!(wire.get("ingest_id").is_none());

        assert_eq!(BrokerMessage::decode(&body).unwrap(), msg);
    }

    #[test]
    fn kind_names() {
        assert_eq!(MessageKind::Envelope.to_string(), "envelope");
        assert_eq!(MessageKind::parse("log"), Some(MessageKind::Log));
        assert_eq!(MessageKind::parse("LOG"), None);
    }
}
