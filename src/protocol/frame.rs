//! Message Framing
//!
//! Forward messages carry no length prefix, so the only way to know that a
//! message has fully arrived is to walk its structure. [`FrameScanner`] does
//! that walk without building any values, and resumes where the previous call
//! stopped. A message that trickles in over many reads is therefore scanned
//! once in total, and the full [`decode_message`](super::decode_message) runs
//! once it is complete.
//!
//! ## MessagePack
//!
//! The walk keeps a byte offset and a count of values still owed. Containers
//! add their element count (twice that for maps), strings, binaries and
//! extensions are skipped by their declared length. The declared length also
//! tells the caller how many bytes the message needs before they arrive.
//!
//! ## JSON
//!
//! The walk tracks bracket depth and whether it is inside a string literal.
//! The message ends at the bracket that closes the opening one.

use crate::protocol::parser::Codec;

/// Result of scanning the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The first `n` bytes hold one whole message (or only separator whitespace)
    Complete(usize),

    /// More bytes are needed; the buffer must hold at least `needed` bytes
    Incomplete { needed: usize },

    /// The bytes cannot form a message; decoding will report why
    Invalid,
}

/// Incremental message boundary finder.
///
/// Each call to [`scan`](FrameScanner::scan) must see the same buffer as the
/// previous call, possibly with more bytes appended. Call
/// [`reset`](FrameScanner::reset) after consuming a message from the front.
#[derive(Debug, Clone, Default)]
pub struct FrameScanner {
    walk: Option<Walk>,
}

#[derive(Debug, Clone, Copy)]
enum Walk {
    MessagePack {
        pos: usize,
        pending: u64,
    },
    Json {
        pos: usize,
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
    Done(Frame),
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the bytes appended since the last call.
    pub fn scan(&mut self, buf: &[u8]) -> Frame {
        let mut walk = match self.walk {
            Some(walk) => walk,
            None => {
                let skipped = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                let first = match buf.get(skipped) {
                    Some(&byte) => byte,
                    None if skipped == 0 => return Frame::Incomplete { needed: 1 },
                    None => return Frame::Complete(skipped),
                };
                match Codec::sniff(first) {
                    Codec::MessagePack => Walk::MessagePack {
                        pos: skipped,
                        pending: 1,
                    },
                    Codec::Json => Walk::Json {
                        pos: skipped,
                        depth: 0,
                        in_string: false,
                        escaped: false,
                    },
                }
            }
        };

        let frame = walk.advance(buf);
        self.walk = Some(walk);
        frame
    }

    /// Forgets the current message.
    pub fn reset(&mut self) {
        self.walk = None;
    }
}

impl Walk {
    fn advance(&mut self, buf: &[u8]) -> Frame {
        let frame = match self {
            Walk::MessagePack { pos, pending } => scan_msgpack(buf, pos, pending),
            Walk::Json {
                pos,
                depth,
                in_string,
                escaped,
            } => scan_json(buf, pos, depth, in_string, escaped),
            Walk::Done(frame) => return *frame,
        };

        if !matches!(frame, Frame::Incomplete { .. }) {
            *self = Walk::Done(frame);
        }
        frame
    }
}

fn scan_msgpack(buf: &[u8], pos: &mut usize, pending: &mut u64) -> Frame {
    while *pending > 0 {
        if *pos >= buf.len() {
            return Frame::Incomplete {
                needed: pos.saturating_add(1),
            };
        }

        match msgpack_item(&buf[*pos..]) {
            Item::Value { skip, children } => {
                *pos = pos.saturating_add(skip);
                *pending = (*pending - 1).saturating_add(children);
            }
            Item::Header(len) => {
                return Frame::Incomplete {
                    needed: pos.saturating_add(len),
                }
            }
            Item::Invalid => return Frame::Invalid,
        }
    }

    if *pos > buf.len() {
        Frame::Incomplete { needed: *pos }
    } else {
        Frame::Complete(*pos)
    }
}

fn scan_json(
    buf: &[u8],
    pos: &mut usize,
    depth: &mut usize,
    in_string: &mut bool,
    escaped: &mut bool,
) -> Frame {
    while let Some(&byte) = buf.get(*pos) {
        *pos += 1;

        if *in_string {
            if *escaped {
                *escaped = false;
            } else if byte == b'\\' {
                *escaped = true;
            } else if byte == b'"' {
                *in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => *in_string = true,
            b'{' | b'[' => *depth += 1,
            b'}' | b']' => {
                *depth = depth.saturating_sub(1);
                if *depth == 0 {
                    return Frame::Complete(*pos);
                }
            }
            _ => {}
        }
    }

    Frame::Incomplete {
        needed: buf.len() + 1,
    }
}

/// One MessagePack value header.
enum Item {
    /// Skip `skip` bytes (header and payload); `children` values follow
    Value { skip: usize, children: u64 },
    /// The header itself needs this many bytes
    Header(usize),
    Invalid,
}

/// What follows a length field.
#[derive(Clone, Copy)]
enum Body {
    Payload,
    Array,
    Map,
}

/// Decodes the header at the front of `buf` (non-empty).
fn msgpack_item(buf: &[u8]) -> Item {
    let marker = buf[0];

    let (width, extra, body) = match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => return scalar(1),
        0x80..=0x8f => {
            return Item::Value {
                skip: 1,
                children: 2 * u64::from(marker & 0x0f),
            }
        }
        0x90..=0x9f => {
            return Item::Value {
                skip: 1,
                children: u64::from(marker & 0x0f),
            }
        }
        0xa0..=0xbf => return scalar(1 + usize::from(marker & 0x1f)),
        0xc1 => return Item::Invalid,

        0xcc | 0xd0 => return scalar(2),
        0xcd | 0xd1 => return scalar(3),
        0xca | 0xce | 0xd2 => return scalar(5),
        0xcb | 0xcf | 0xd3 => return scalar(9),

        // fixext 1, 2, 4, 8, 16: marker, type, data
        0xd4 => return scalar(3),
        0xd5 => return scalar(4),
        0xd6 => return scalar(6),
        0xd7 => return scalar(10),
        0xd8 => return scalar(18),

        0xc4 | 0xd9 => (1, 0, Body::Payload),
        0xc5 | 0xda => (2, 0, Body::Payload),
        0xc6 | 0xdb => (4, 0, Body::Payload),
        // ext 8, 16, 32 carry a type byte after the length
        0xc7 => (1, 1, Body::Payload),
        0xc8 => (2, 1, Body::Payload),
        0xc9 => (4, 1, Body::Payload),
        0xdc => (2, 0, Body::Array),
        0xdd => (4, 0, Body::Array),
        0xde => (2, 0, Body::Map),
        0xdf => (4, 0, Body::Map),
    };

    let header = 1 + width + extra;
    if buf.len() < header {
        return Item::Header(header);
    }

    let len = buf[1..1 + width]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

    match body {
        Body::Payload => Item::Value {
            skip: header.saturating_add(usize::try_from(len).unwrap_or(usize::MAX)),
            children: 0,
        },
        Body::Array => Item::Value {
            skip: header,
            children: len,
        },
        Body::Map => Item::Value {
            skip: header,
            children: 2 * len,
        },
    }
}

fn scalar(skip: usize) -> Item {
    Item::Value { skip, children: 0 }
}
