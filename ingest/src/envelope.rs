//! Parser for the multi-item envelope wire format.
//!
//! ```text
//! <header-json>\n
//! <item-header-json>\n
//! <item-payload>\n?
//! ...
//! ```
//!
//! An item payload is either exactly `length` bytes (when the item header
//! declares one) or the next line.

use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("empty envelope")]
    Empty,
    #[error("invalid envelope: empty header")]
    EmptyHeader,
    #[error("invalid envelope header: {0}")]
    InvalidHeader(#[source] serde_json::Error),
    #[error("invalid item header: {0}")]
    InvalidItemHeader(#[source] serde_json::Error),
    #[error("invalid item length: {0}")]
    InvalidLength(Value),
    #[error("unexpected end of envelope: item needs {wanted} bytes, {remaining} remaining")]
    UnexpectedEof { wanted: usize, remaining: usize },
    #[error("item is missing its payload line")]
    MissingPayload,
    #[error("invalid envelope: no items")]
    NoItems,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: JsonObject,
    pub items: Vec<EnvelopeItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    pub header: JsonObject,
    pub payload: Vec<u8>,
}

impl EnvelopeItem {
    pub fn item_type(&self) -> Option<&str> {
        self.header.get("type").and_then(Value::as_str)
    }
}

impl Envelope {
    /// Returns the first `event` item whose payload is a JSON object.
    ///
    /// Items of other types and event items that fail to decode are skipped.
    pub fn first_event_json(&self) -> Option<JsonObject> {
        self.items
            .iter()
            .filter(|item| item.item_type() == Some("event"))
            .find_map(|item| serde_json::from_slice::<JsonObject>(&item.payload).ok())
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header.get("event_id").and_then(Value::as_str)
    }
}

pub fn parse_envelope(body: &[u8]) -> Result<Envelope, EnvelopeError> {
    let mut reader = Reader::new(body);

    let header_line = reader.read_line().ok_or(EnvelopeError::Empty)?;
    let header_line = header_line.trim_ascii();
    if header_line.is_empty() {
        return Err(EnvelopeError::EmptyHeader);
    }
    let header: JsonObject =
        serde_json::from_slice(header_line).map_err(EnvelopeError::InvalidHeader)?;

    let mut items = Vec::new();
    while let Some(line) = reader.read_line() {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let item_header: JsonObject =
            serde_json::from_slice(line).map_err(EnvelopeError::InvalidItemHeader)?;
        let payload = read_item_payload(&mut reader, &item_header)?;
        items.push(EnvelopeItem {
            header: item_header,
            payload,
        });
    }

    if items.is_empty() {
        return Err(EnvelopeError::NoItems);
    }
    Ok(Envelope { header, items })
}

fn read_item_payload(reader: &mut Reader<'_>, header: &JsonObject) -> Result<Vec<u8>, EnvelopeError> {
    let Some(length) = header.get("length") else {
        let line = reader.read_line().ok_or(EnvelopeError::MissingPayload)?;
        return Ok(line.trim_ascii().to_vec());
    };

    let wanted = declared_length(length)?;
    if wanted == 0 {
        return Ok(Vec::new());
    }
    let payload = reader.read_exact(wanted)?.to_vec();
    reader.skip_newlines();
    Ok(payload)
}

/// Accepts JSON numbers and numeric strings. Fractional lengths are truncated.
fn declared_length(value: &Value) -> Result<usize, EnvelopeError> {
    let invalid = || EnvelopeError::InvalidLength(value.clone());
    let n = match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u as f64
            } else if let Some(f) = n.as_f64() {
                f
            } else {
                return Err(invalid());
            }
        }
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    if !n.is_finite() || n < 0.0 {
        return Err(invalid());
    }
    Ok(n.trunc() as usize)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Next line without its terminator and with `\r` removed. `None` at end of input.
    ///
    /// A final unterminated line is still returned.
    fn read_line(&mut self) -> Option<Vec<u8>> {
        let rest = self.remaining();
        if rest.is_empty() {
            return None;
        }
        let (line, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Some(line.iter().copied().filter(|&b| b != b'\r').collect())
    }

    fn read_exact(&mut self, wanted: usize) -> Result<&'a [u8], EnvelopeError> {
        let rest = self.remaining();
        if rest.len() < wanted {
            return Err(EnvelopeError::UnexpectedEof {
                wanted,
                remaining: rest.len(),
            });
        }
        self.pos += wanted;
        Ok(&rest[..wanted])
    }

    fn skip_newlines(&mut self) {
        let skip = self
            .remaining()
            .iter()
            .take_while(|&&b| b == b'\n' || b == b'\r')
            .count();
        self.pos += skip;
    }
}
