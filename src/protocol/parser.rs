//! Forward Protocol Decoder
//!
//! This module turns the front of a connection's read buffer into
//! [`RecordSet`]s. It handles every historical encoding of the Fluentd
//! Forward protocol without any version negotiation.
//!
//! ## Codec Sniffing
//!
//! The first byte of each message picks the codec:
//! - `{` or `[` → JSON
//! - anything else → MessagePack
//!
//! Leading ASCII whitespace is skipped first. Those bytes separate JSON
//! messages, and none of them can start a MessagePack forward message (which
//! always begins with an array marker).
//!
//! ## Message Shapes
//!
//! ```text
//! Message        [tag, time, record, option?]
//! Forward        [tag, [[time, record], [time, record], ...], option?]
//! PackedForward  [tag, bin(<entry><entry>...), option?]
//! ```
//!
//! The type of the second element decides the shape. In the packed form the
//! blob is a plain concatenation of MessagePack `[time, record]` entries with
//! no count or length prefix. JSON has no binary type, so a JSON message never
//! takes the packed form.
//!
//! ## How the Decoder Works
//!
//! [`decode_message`] is incremental and returns either:
//! - `Ok(Some((record_sets, consumed)))` - one message decoded from `consumed` bytes
//! - `Ok(None)` - the buffer holds an incomplete message, read more
//! - `Err(DecodeError)` - the message is malformed
//!
//! Nothing past the first message is consumed, so the caller can keep the
//! remaining bytes for the next call.

use crate::protocol::types::{Fields, Record, RecordSet, Value};
use std::io::{self, Cursor};
use thiserror::Error;

/// Errors that can occur while decoding a forward message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// The top-level value is not a `[tag, ...]` sequence
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The tag is neither text nor a byte string
    #[error("failed to decode tag field: expected string, got {0}")]
    MalformedTag(&'static str),

    /// An entry or its fields have the wrong shape
    #[error("failed to decode record set: {0}")]
    MalformedRecordSet(String),

    /// The second element is not a timestamp, an entry list or a blob
    #[error("unknown message shape: second element is {0}")]
    UnknownMessageShape(&'static str),

    /// A float timestamp that cannot be represented as seconds since the epoch
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    /// The MessagePack codec rejected the bytes
    #[error("msgpack: {0}")]
    MessagePack(String),

    /// The JSON codec rejected the bytes
    #[error("json: {0}")]
    Json(String),
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Wire codec of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    MessagePack,
    Json,
}

impl Codec {
    /// Picks the codec from the first byte of a message.
    #[inline]
    pub fn sniff(first: u8) -> Self {
        match first {
            b'{' | b'[' => Codec::Json,
            _ => Codec::MessagePack,
        }
    }
}

/// Decodes the next forward message from the front of `buf`.
///
/// # Returns
///
/// - `Ok(Some((record_sets, consumed)))` - a message (or only separator
///   whitespace, in which case `record_sets` is empty) was decoded
/// - `Ok(None)` - incomplete data, need more bytes
/// - `Err(e)` - decode error
pub fn decode_message(buf: &[u8]) -> DecodeResult<Option<(Vec<RecordSet>, usize)>> {
    let skipped = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();

    let first = match buf.get(skipped) {
        Some(&byte) => byte,
        None if skipped == 0 => return Ok(None),
        None => return Ok(Some((Vec::new(), skipped))),
    };

    let codec = Codec::sniff(first);
    let (message, consumed) = match decode_value(codec, &buf[skipped..])? {
        Some(decoded) => decoded,
        None => return Ok(None),
    };

    let record_set = decode_record_set(message)?;
    Ok(Some((vec![record_set], skipped + consumed)))
}

/// Decodes a single value with the given codec.
fn decode_value(codec: Codec, buf: &[u8]) -> DecodeResult<Option<(Value, usize)>> {
    match codec {
        Codec::MessagePack => {
            let mut cursor = Cursor::new(buf);
            match rmp_serde::from_read::<_, Value>(&mut cursor) {
                Ok(value) => Ok(Some((value, cursor.position() as usize))),
                Err(e) if is_msgpack_eof(&e) => Ok(None),
                Err(e) => Err(DecodeError::MessagePack(e.to_string())),
            }
        }
        Codec::Json => {
            let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => Ok(Some((value, stream.byte_offset()))),
                Some(Err(e)) if e.is_eof() => Ok(None),
                Some(Err(e)) => Err(DecodeError::Json(e.to_string())),
                None => Ok(None),
            }
        }
    }
}

fn is_msgpack_eof(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;

    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Interprets a decoded top-level value as one of the three message shapes.
fn decode_record_set(message: Value) -> DecodeResult<RecordSet> {
    let (tag, second, third) = match message {
        Value::Array(items) => {
            let len = items.len();
            let mut items = items.into_iter();
            // Anything past the third element is the option map; ignored.
            match (items.next(), items.next(), items.next()) {
                (Some(tag), Some(second), third) => (tag, second, third),
                _ => {
                    return Err(DecodeError::MalformedMessage(format!(
                        "expected at least 2 elements, got {}",
                        len
                    )))
                }
            }
        }
        other => {
            return Err(DecodeError::MalformedMessage(format!(
                "expected array, got {}",
                other.type_name()
            )))
        }
    };

    let tag = decode_tag(tag)?;

    let records = match second {
        Value::UInt(ts) => vec![Record::new(ts, decode_fields(third)?)],
        Value::Float(ts) => vec![Record::new(float_timestamp(ts)?, decode_fields(third)?)],
        Value::Array(entries) => entries
            .into_iter()
            .map(decode_entry)
            .collect::<DecodeResult<Vec<_>>>()?,
        Value::Binary(blob) => decode_packed(&blob)?,
        other => return Err(DecodeError::UnknownMessageShape(other.type_name())),
    };

    Ok(RecordSet::new(tag, records))
}

fn decode_tag(value: Value) -> DecodeResult<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Binary(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        other => Err(DecodeError::MalformedTag(other.type_name())),
    }
}

fn decode_timestamp(value: &Value) -> DecodeResult<u64> {
    match value {
        Value::UInt(ts) => Ok(*ts),
        Value::Float(ts) => float_timestamp(*ts),
        other => Err(DecodeError::MalformedRecordSet(format!(
            "expected timestamp, got {}",
            other.type_name()
        ))),
    }
}

/// Truncates toward zero. Negative, non-finite and out-of-range values are rejected.
fn float_timestamp(ts: f64) -> DecodeResult<u64> {
    // u64::MAX as f64 rounds up to 2^64, so `<` keeps the cast in range
    if ts.is_finite() && ts >= 0.0 && ts < u64::MAX as f64 {
        Ok(ts as u64)
    } else {
        Err(DecodeError::InvalidTimestamp(ts))
    }
}

fn decode_fields(value: Option<Value>) -> DecodeResult<Fields> {
    match value {
        Some(Value::Map(fields)) => Ok(fields),
        Some(other) => Err(DecodeError::MalformedRecordSet(format!(
            "expected record map, got {}",
            other.type_name()
        ))),
        None => Err(DecodeError::MalformedRecordSet(
            "missing record map".to_string(),
        )),
    }
}

/// Decodes one `[timestamp, fields]` entry.
fn decode_entry(entry: Value) -> DecodeResult<Record> {
    let items = match entry {
        Value::Array(items) if items.len() == 2 => items,
        Value::Array(items) => {
            return Err(DecodeError::MalformedRecordSet(format!(
                "expected [time, record] entry, got {} elements",
                items.len()
            )))
        }
        other => {
            return Err(DecodeError::MalformedRecordSet(format!(
                "expected [time, record] entry, got {}",
                other.type_name()
            )))
        }
    };

    let mut items = items.into_iter();
    let timestamp = match items.next() {
        Some(ts) => decode_timestamp(&ts)?,
        None => return Err(DecodeError::MalformedRecordSet("empty entry".to_string())),
    };
    Ok(Record::new(timestamp, decode_fields(items.next())?))
}

/// Decodes MessagePack entries from a packed blob until it is exhausted.
fn decode_packed(blob: &[u8]) -> DecodeResult<Vec<Record>> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < blob.len() {
        match decode_value(Codec::MessagePack, &blob[offset..])? {
            Some((entry, consumed)) => {
                records.push(decode_entry(entry)?);
                offset += consumed;
            }
            None => {
                return Err(DecodeError::MalformedRecordSet(format!(
                    "truncated entry at offset {} of {}-byte packed blob",
                    offset,
                    blob.len()
                )))
            }
        }
    }

    Ok(records)
}
