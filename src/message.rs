//! Framed, self-describing messages carried across the transport.
//!
//! Wire layout: `[size: u64][tag: u32][src-group][src-id: u64][dst-group][dst-id]
//! [metadata][payload]`, all integers little-endian. `size` counts every byte after itself.
//! Metadata uses a length-prefixed tagged-value stream rather than a general serializer, because
//! the layout itself, not just the data, is part of the contract a framing-resync test exercises.

use crate::error::TransportError;
use crate::metadata::{Metadata, Value};
use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Discriminates the kind of message flowing through the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tag {
    #[default]
    Empty = 0,
    Open = 1,
    Close = 2,
    Grib = 3,
    Domain = 4,
    Mask = 5,
    Field = 6,
    StepComplete = 7,
    StatisticsUpdate = 8,
}

impl Tag {
    fn from_u32(v: u32) -> Result<Self, TransportError> {
        Ok(match v {
            0 => Tag::Empty,
            1 => Tag::Open,
            2 => Tag::Close,
            3 => Tag::Grib,
            4 => Tag::Domain,
            5 => Tag::Mask,
            6 => Tag::Field,
            7 => Tag::StepComplete,
            8 => Tag::StatisticsUpdate,
            other => return Err(TransportError::Framing(format!("unknown tag {other}"))),
        })
    }
}

/// `{tag, source, destination, metadata}` — everything but the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub tag: Tag,
    pub source: Peer,
    pub destination: Peer,
    pub metadata: Metadata,
}

/// A framed unit on the wire: a [`Header`] plus an owned, opaque byte payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn tag(&self) -> Tag {
        self.header.tag
    }

    pub fn source(&self) -> &Peer {
        &self.header.source
    }

    pub fn destination(&self) -> &Peer {
        &self.header.destination
    }

    pub fn metadata(&self) -> &Metadata {
        &self.header.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.header.metadata
    }

    /// A copy with a new destination, used for `toAllServers` fan-out — the one sanctioned copy
    /// path; copies are otherwise explicit and rare.
    pub fn cloned_for(&self, destination: Peer) -> Message {
        Message {
            header: Header {
                tag: self.header.tag,
                source: self.header.source.clone(),
                destination,
                metadata: self.header.metadata.clone(),
            },
            payload: self.payload.clone(),
        }
    }

    /// Deterministic string key identifying all parts of one global field, derived from a
    /// configurable tuple of metadata keys.
    pub fn field_id(&self, hash_keys: &[String]) -> Result<String, crate::error::MetadataError> {
        let mut out = String::new();
        for key in hash_keys {
            out.push_str(&metadata_value_as_string(self.metadata(), key)?);
            out.push('\u{1f}'); // unit separator avoids accidental collisions between keys
        }
        Ok(out)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.header.tag as u32).to_le_bytes());
        write_string(&mut body, self.header.source.group());
        body.extend_from_slice(&self.header.source.id().to_le_bytes());
        write_string(&mut body, self.header.destination.group());
        body.extend_from_slice(&self.header.destination.id().to_le_bytes());
        encode_metadata(&mut body, &self.header.metadata);
        body.extend_from_slice(&self.payload);

        let mut framed = Vec::with_capacity(8 + body.len());
        framed.extend_from_slice(&(body.len() as u64).to_le_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    /// Decodes a `Message` from an exact `body` slice (i.e. the bytes following the `size`
    /// prefix, already read in full). Used by transports after they've read `size` bytes.
    pub fn from_body_bytes(body: &[u8]) -> Result<Self, TransportError> {
        let mut cur = Cursor::new(body);
        let tag = Tag::from_u32(read_u32(&mut cur)?)?;
        let src_group = read_string(&mut cur)?;
        let src_id = read_u64(&mut cur)?;
        let dst_group = read_string(&mut cur)?;
        let dst_id = read_u64(&mut cur)?;
        let metadata = decode_metadata(&mut cur)?;
        let pos = cur.position() as usize;
        let payload = body[pos..].to_vec();

        Ok(Message {
            header: Header {
                tag,
                source: Peer::new(src_group, src_id),
                destination: Peer::new(dst_group, dst_id),
                metadata,
            },
            payload,
        })
    }
}

fn metadata_value_as_string(
    metadata: &Metadata,
    key: &str,
) -> Result<String, crate::error::MetadataError> {
    let raw = metadata
        .get_raw(key)
        .ok_or_else(|| crate::error::MetadataError::MissingKey(key.to_string()))?;
    Ok(match raw {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::String(s) => s.clone(),
        Value::Nested(_) | Value::List(_) => format!("{raw:?}"),
    })
}

// ---- little-endian primitive helpers -------------------------------------------------------

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, TransportError> {
    let mut buf = [0u8; 4];
    read_exact(cur, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64, TransportError> {
    let mut buf = [0u8; 8];
    read_exact(cur, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, TransportError> {
    let len = read_u32(cur)? as usize;
    let start = cur.position() as usize;
    let slice = cur
        .get_ref()
        .get(start..start + len)
        .ok_or_else(|| TransportError::Framing("truncated string".into()))?;
    cur.set_position((start + len) as u64);
    String::from_utf8(slice.to_vec())
        .map_err(|e| TransportError::Framing(format!("invalid utf-8 in string: {e}")))
}

fn read_exact(cur: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), TransportError> {
    let start = cur.position() as usize;
    let end = start + buf.len();
    let slice = cur
        .get_ref()
        .get(start..end)
        .ok_or_else(|| TransportError::Framing("truncated message".into()))?;
    buf.copy_from_slice(slice);
    cur.set_position(end as u64);
    Ok(())
}

// ---- metadata tagged-value stream ----------------------------------------------------------

const TYPE_BOOL: u8 = 0;
const TYPE_INT: u8 = 1;
const TYPE_DOUBLE: u8 = 2;
const TYPE_STRING: u8 = 3;
const TYPE_NESTED: u8 = 4;
const TYPE_LIST: u8 = 5;

fn encode_metadata(out: &mut Vec<u8>, metadata: &Metadata) {
    out.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    for (key, value) in metadata.iter() {
        write_string(out, key);
        encode_value(out, value);
    }
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bool(b) => {
            out.push(TYPE_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        Value::Int(i) => {
            out.push(TYPE_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Double(d) => {
            out.push(TYPE_DOUBLE);
            out.extend_from_slice(&d.to_le_bytes());
        }
        Value::String(s) => {
            out.push(TYPE_STRING);
            write_string(out, s);
        }
        Value::Nested(m) => {
            out.push(TYPE_NESTED);
            encode_metadata(out, m);
        }
        Value::List(items) => {
            out.push(TYPE_LIST);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            // element-type tag is redundant with per-element tags but kept for spec fidelity
            let element_type = items.first().map(value_type_tag).unwrap_or(TYPE_BOOL);
            out.push(element_type);
            for item in items {
                encode_value(out, item);
            }
        }
    }
}

fn value_type_tag(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => TYPE_BOOL,
        Value::Int(_) => TYPE_INT,
        Value::Double(_) => TYPE_DOUBLE,
        Value::String(_) => TYPE_STRING,
        Value::Nested(_) => TYPE_NESTED,
        Value::List(_) => TYPE_LIST,
    }
}

fn decode_metadata(cur: &mut Cursor<&[u8]>) -> Result<Metadata, TransportError> {
    let count = read_u32(cur)?;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = read_string(cur)?;
        let value = decode_value(cur)?;
        metadata.set(key, value);
    }
    Ok(metadata)
}

fn decode_value(cur: &mut Cursor<&[u8]>) -> Result<Value, TransportError> {
    let mut type_byte = [0u8; 1];
    read_exact(cur, &mut type_byte)?;
    Ok(match type_byte[0] {
        TYPE_BOOL => {
            let mut b = [0u8; 1];
            read_exact(cur, &mut b)?;
            Value::Bool(b[0] != 0)
        }
        TYPE_INT => {
            let mut b = [0u8; 8];
            read_exact(cur, &mut b)?;
            Value::Int(i64::from_le_bytes(b))
        }
        TYPE_DOUBLE => {
            let mut b = [0u8; 8];
            read_exact(cur, &mut b)?;
            Value::Double(f64::from_le_bytes(b))
        }
        TYPE_STRING => Value::String(read_string(cur)?),
        TYPE_NESTED => Value::Nested(decode_metadata(cur)?),
        TYPE_LIST => {
            let count = read_u32(cur)?;
            let mut element_type = [0u8; 1];
            read_exact(cur, &mut element_type)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(cur)?);
            }
            Value::List(items)
        }
        other => return Err(TransportError::Framing(format!("unknown value type {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(payload: Vec<u8>) -> Message {
        let mut metadata = Metadata::new();
        metadata.set("category", "ocean");
        metadata.set("name", "sst");
        metadata.set("level", 1_i64);
        metadata.set("toAllServers", false);
        metadata.set("scale", 1.5_f64);
        metadata.set(
            "levels",
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
        let mut nested = Metadata::new();
        nested.set("units", "K");
        metadata.set("extra", nested);

        Message::new(
            Header {
                tag: Tag::Field,
                source: Peer::new("client", 0),
                destination: Peer::new("server", 1),
                metadata,
            },
            payload,
        )
    }

    fn round_trip(msg: &Message) -> Message {
        let framed = msg.to_bytes();
        let size = u64::from_le_bytes(framed[0..8].try_into().unwrap()) as usize;
        assert_eq!(framed.len(), 8 + size);
        Message::from_body_bytes(&framed[8..]).unwrap()
    }

    #[test]
    fn round_trip_with_nonempty_payload() {
        let msg = sample_message(vec![1, 2, 3, 4, 5]);
        let decoded = round_trip(&msg);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_with_empty_payload() {
        let msg = sample_message(vec![]);
        let decoded = round_trip(&msg);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_body_is_a_framing_error() {
        let msg = sample_message(vec![9, 9, 9]);
        let framed = msg.to_bytes();
        let truncated = &framed[8..framed.len() - 5];
        assert!(matches!(
            Message::from_body_bytes(truncated),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn unknown_tag_is_a_framing_error() {
        let msg = sample_message(vec![]);
        let mut framed = msg.to_bytes();
        // tag is the first u32 after the 8-byte size prefix
        framed[8] = 200;
        assert!(matches!(
            Message::from_body_bytes(&framed[8..]),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn field_id_is_derived_from_configured_keys() {
        let msg = sample_message(vec![]);
        let keys = vec!["category".to_string(), "name".to_string(), "level".to_string()];
        let id = msg.field_id(&keys).unwrap();
        assert_eq!(id, "ocean\u{1f}sst\u{1f}1\u{1f}");

        // same metadata, same id
        let other = sample_message(vec![42]);
        assert_eq!(other.field_id(&keys).unwrap(), id);
    }

    #[test]
    fn field_id_fails_on_missing_hash_key() {
        let msg = sample_message(vec![]);
        let keys = vec!["missing-key".to_string()];
        assert!(msg.field_id(&keys).is_err());
    }
}
