//! Extraction of user and device identity from loosely structured SDK payloads.

use crate::envelope::JsonObject;
use chrono::{DateTime, Utc};
use serde_json::Value;

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn str_field<'a>(obj: &'a JsonObject, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn object_field<'a>(obj: &'a JsonObject, key: &str) -> Option<&'a JsonObject> {
    obj.get(key).and_then(Value::as_object)
}

/// `user.id`, then `user.username`, then `user.email`.
pub fn user_id(user: Option<&JsonObject>) -> Option<String> {
    let user = user?;
    ["id", "username", "email"]
        .into_iter()
        .find_map(|key| str_field(user, key).and_then(non_empty))
}

/// Looks up `key` in tags sent either as an object or as `[[key, value], ...]`.
pub fn tag_value(tags: Option<&Value>, key: &str) -> Option<String> {
    match tags? {
        Value::Object(map) => map.get(key).and_then(Value::as_str).and_then(non_empty),
        Value::Array(pairs) => pairs
            .iter()
            .filter_map(Value::as_array)
            .filter(|pair| pair.len() >= 2)
            .find(|pair| pair[0].as_str() == Some(key))
            .and_then(|pair| match &pair[1] {
                Value::String(s) => non_empty(s),
                other => non_empty(&other.to_string()),
            }),
        _ => None,
    }
}

pub fn device_id(event: &JsonObject) -> Option<String> {
    tag_value(event.get("tags"), "device_id")
        .or_else(|| {
            object_field(event, "contexts")
                .and_then(|contexts| object_field(contexts, "device"))
                .and_then(|device| str_field(device, "id"))
                .and_then(non_empty)
        })
        .or_else(|| tag_value(event.get("extra"), "device_id"))
}

pub fn distinct_id(event: &JsonObject) -> Option<String> {
    user_id(object_field(event, "user")).or_else(|| device_id(event))
}

/// `"<name> <version>"` from `contexts.os`.
pub fn os(event: &JsonObject) -> Option<String> {
    let os = object_field(event, "contexts").and_then(|contexts| object_field(contexts, "os"))?;
    let name = str_field(os, "name").and_then(non_empty)?;
    match str_field(os, "version").and_then(non_empty) {
        Some(version) => Some(format!("{name} {version}")),
        None => Some(name),
    }
}

/// The event message, else `"<type>: <value>"` of the first exception.
pub fn title(event: &JsonObject) -> String {
    if let Some(message) = str_field(event, "message").filter(|m| !m.is_empty()) {
        return message.to_owned();
    }
    let first = object_field(event, "exception")
        .and_then(|exc| exc.get("values"))
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_object);
    let Some(first) = first else {
        return String::new();
    };
    let ty = str_field(first, "type").unwrap_or_default();
    let value = str_field(first, "value").unwrap_or_default();
    match (ty.is_empty(), value.is_empty()) {
        (false, false) => format!("{ty}: {value}"),
        (false, true) => ty.to_owned(),
        (true, false) => value.to_owned(),
        (true, true) => String::new(),
    }
}

/// RFC 3339 strings or unix seconds (integer or fractional).
pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                return DateTime::from_timestamp(secs, 0);
            }
            let f = n.as_f64()?;
            let secs = f.floor();
            let nanos = ((f - secs) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(secs as i64, nanos)
        }
        _ => None,
    }
}
