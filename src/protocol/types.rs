//! Forward Protocol Data Types
//!
//! This module defines the in-memory record model produced by the decoder.
//! Clients may speak MessagePack or JSON, so every decoded value is first
//! captured as a [`Value`], a closed tagged variant covering everything either
//! codec can put on the wire.
//!
//! ## Model
//!
//! ```text
//! RecordSet { tag: "app.log" }
//!     │
//!     ├── Record { timestamp: 1700000000, fields: { "msg": "hi" } }
//!     ├── Record { timestamp: 1700000001, fields: { "msg": "bye" } }
//!     └── ...
//! ```
//!
//! One [`RecordSet`] is produced per wire message. A single message may carry
//! many records sharing one tag.
//!
//! ## Normalization
//!
//! MessagePack distinguishes `str` from `bin`, and older Fluentd clients send
//! every string as `bin`. Before a record is exposed, byte strings are turned
//! into text at every nesting depth, so a consumer never sees
//! [`Value::Binary`] inside [`Record::fields`].

use bytes::Bytes;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Field mapping of a single record.
pub type Fields = BTreeMap<String, Value>;

/// A dynamically typed value decoded from the wire.
///
/// Non-negative integers always decode as [`Value::UInt`], so `Int` only ever
/// carries negative numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `nil` / `null`
    Nil,

    /// `true` / `false`
    Boolean(bool),

    /// Negative integer
    Int(i64),

    /// Non-negative integer
    UInt(u64),

    /// 32- or 64-bit float
    Float(f64),

    /// UTF-8 text
    String(String),

    /// Raw byte string (MessagePack `bin`, or a `str` holding invalid UTF-8)
    Binary(Bytes),

    /// Sequence of values
    Array(Vec<Value>),

    /// Mapping with text keys
    Map(Fields),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Returns true if this value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Attempts to extract the inner text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Attempts to extract the inner unsigned integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to extract the inner map.
    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Replaces every byte string with text, recursing into arrays and maps.
    ///
    /// Invalid UTF-8 sequences are replaced with U+FFFD.
    pub fn normalize(self) -> Value {
        match self {
            Value::Binary(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
            Value::Array(items) => Value::Array(items.into_iter().map(Value::normalize).collect()),
            Value::Map(fields) => Value::Map(normalize_fields(fields)),
            other => other,
        }
    }
}

/// Normalizes every value of a field mapping. See [`Value::normalize`].
pub fn normalize_fields(fields: Fields) -> Fields {
    fields
        .into_iter()
        .map(|(key, value)| (key, value.normalize()))
        .collect()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        if n >= 0 {
            Value::UInt(n as u64)
        } else {
            Value::Int(n)
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Map(fields)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::UInt(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Binary(b) => write!(f, "(binary data, {} bytes)", b.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::UInt(n) => serializer.serialize_u64(*n),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(b) => serializer.serialize_bytes(b),
            Value::Array(items) => items.serialize(serializer),
            Value::Map(fields) => fields.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a MessagePack or JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Boolean(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::UInt(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Binary(Bytes::copy_from_slice(v)))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Binary(Bytes::from(v)))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        // size_hint comes from the wire; don't trust it for the allocation
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut fields = Fields::new();
        while let Some((MapKey(key), value)) = map.next_entry::<MapKey, Value>()? {
            fields.insert(key, value);
        }
        Ok(Value::Map(fields))
    }
}

/// Map key accepting text or byte strings.
struct MapKey(String);

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MapKeyVisitor)
    }
}

struct MapKeyVisitor;

impl<'de> Visitor<'de> for MapKeyVisitor {
    type Value = MapKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string map key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MapKey, E> {
        Ok(MapKey(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<MapKey, E> {
        Ok(MapKey(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<MapKey, E> {
        Ok(MapKey(String::from_utf8_lossy(v).into_owned()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<MapKey, E> {
        Ok(MapKey(match String::from_utf8(v) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }))
    }
}

/// A single timestamped log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    timestamp: u64,
    fields: Fields,
}

impl Record {
    /// Creates a record. Fields are normalized on the way in.
    pub fn new(timestamp: u64, fields: Fields) -> Self {
        Self {
            timestamp,
            fields: normalize_fields(fields),
        }
    }

    /// Event time in seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Looks up a single field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Records decoded from one wire message, all sharing one tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSet {
    tag: String,
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new(tag: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            tag: tag.into(),
            records,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consumes the set and returns its records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Number of records in the set.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn test_normalize_nested_binary() {
        let value = map(vec![
            ("msg", Value::Binary(Bytes::from("hi"))),
            (
                "nested",
                map(vec![(
                    "deeper",
                    map(vec![("bin", Value::Binary(Bytes::from("x")))]),
                )]),
            ),
            (
                "list",
                Value::Array(vec![Value::Binary(Bytes::from("a")), Value::UInt(1)]),
            ),
        ]);

        let expected = map(vec![
            ("msg", Value::from("hi")),
            (
                "nested",
                map(vec![("deeper", map(vec![("bin", Value::from("x"))]))]),
            ),
            (
                "list",
                Value::Array(vec![Value::from("a"), Value::UInt(1)]),
            ),
        ]);

        assert_eq!(value.normalize(), expected);
    }

    #[test]
    fn test_normalize_invalid_utf8_is_lossy() {
        let value = Value::Binary(Bytes::from(&b"ok\xff"[..]));
        assert_eq!(value.normalize(), Value::from("ok\u{fffd}"));
    }

    #[test]
    fn test_record_new_normalizes_fields() {
        let mut fields = Fields::new();
        fields.insert("msg".to_string(), Value::Binary(Bytes::from("hi")));
        let record = Record::new(42, fields);

        assert_eq!(record.timestamp(), 42);
        assert_eq!(record.get("msg"), Some(&Value::from("hi")));
    }

    #[test]
    fn test_deserialize_msgpack_bin_and_str() {
        let encoded = rmp_serde::to_vec(&Value::Array(vec![
            Value::Binary(Bytes::from("raw")),
            Value::from("text"),
            Value::Int(-3),
            Value::UInt(7),
            Value::Nil,
        ]))
        .unwrap();

        let decoded: Value = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(
            decoded,
            Value::Array(vec![
                Value::Binary(Bytes::from("raw")),
                Value::from("text"),
                Value::Int(-3),
                Value::UInt(7),
                Value::Nil,
            ])
        );
    }

    #[test]
    fn test_deserialize_positive_signed_is_unsigned() {
        // Some encoders emit int64 markers for non-negative numbers
        let mut buf = vec![0xd3];
        buf.extend_from_slice(&1_700_000_000i64.to_be_bytes());
        let decoded: Value = rmp_serde::from_slice(&buf).unwrap();
        assert_eq!(decoded, Value::UInt(1_700_000_000));
    }

    #[test]
    fn test_deserialize_json() {
        let decoded: Value =
            serde_json::from_str(r#"{"a": [1, -2, 1.5, true, null], "b": "x"}"#).unwrap();
        assert_eq!(
            decoded,
            map(vec![
                (
                    "a",
                    Value::Array(vec![
                        Value::UInt(1),
                        Value::Int(-2),
                        Value::Float(1.5),
                        Value::Boolean(true),
                        Value::Nil,
                    ])
                ),
                ("b", Value::from("x")),
            ])
        );
    }

    #[test]
    fn test_deserialize_msgpack_binary_map_key() {
        // fixmap(1) { bin8 "k": fixint 1 }
        let buf = [0x81, 0xc4, 0x01, b'k', 0x01];
        let decoded: Value = rmp_serde::from_slice(&buf).unwrap();
        assert_eq!(decoded, map(vec![("k", Value::UInt(1))]));
    }

    #[test]
    fn test_record_set_serializes_as_json() {
        let mut fields = Fields::new();
        fields.insert("msg".to_string(), Value::from("hi"));
        let set = RecordSet::new("app.log", vec![Record::new(1, fields)]);

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(
            json,
            r#"{"tag":"app.log","records":[{"timestamp":1,"fields":{"msg":"hi"}}]}"#
        );
    }

    #[test]
    fn test_display() {
        let value = map(vec![("a", Value::Array(vec![Value::UInt(1), Value::Nil]))]);
        assert_eq!(value.to_string(), r#"{"a": [1, nil]}"#);
    }
}
