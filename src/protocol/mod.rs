//! Fluentd Forward Protocol Implementation
//!
//! This module decodes the Fluentd Forward protocol into a uniform record model.
//!
//! ## Overview
//!
//! Forward clients (Fluentd, Fluent Bit, logging libraries) stream messages
//! over a plain TCP or Unix socket. Each message is a `[tag, ...]` sequence
//! encoded in MessagePack or JSON, in one of three shapes:
//! single event, inline entry list, or packed entry blob.
//!
//! ## Modules
//!
//! - `types`: Defines the `Value`, `Record` and `RecordSet` types
//! - `parser`: Incremental decoder for incoming forward messages
//! - `frame`: Finds where a message ends before it is decoded
//!
//! ## Example
//!
//! ```
//! use flashfwd::protocol::decode_message;
//!
//! let data = br#"["app.log", 1700000000, {"msg": "hi"}]"#;
//! let (record_sets, consumed) = decode_message(data).unwrap().unwrap();
//!
//! assert_eq!(consumed, data.len());
//! assert_eq!(record_sets[0].tag(), "app.log");
//! assert_eq!(record_sets[0].records()[0].timestamp(), 1700000000);
//! ```

pub mod frame;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use frame::{Frame, FrameScanner};
pub use parser::{decode_message, Codec, DecodeError, DecodeResult};
pub use types::{Fields, Record, RecordSet, Value};
