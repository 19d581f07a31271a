//! Wire codecs for the protocol layer
//!
//! Everything inside a frame is little-endian, matching the outer length
//! header. Two payload shapes exist:
//!
//! - **Greeting** — first frame of a fresh connection:
//!   `port:u16 ‖ force:u8 ‖ endpoint_id:u64 (iff force=1)`
//! - **Batch** — every later frame: records back to back until the end of
//!   the payload, each
//!   `seq_id:u64 ‖ type:u8 ‖ method:u32 ‖ data_len:u64 ‖ data`
//!
//! Records are self-delimiting given the outer length, so a batch needs
//! no count prefix. Decoded record data is sliced out of the frame view
//! without copying.

use bytes::{Buf, BufMut};
use crossbar_core::buffer::SharedView;
use thiserror::Error;

/// Protocol-envelope errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Truncated record")]
    Truncated,

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Declared data length overruns the frame")]
    LengthOverrun,

    #[error("Malformed greeting")]
    MalformedGreeting,
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Record direction within the request/response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
}

impl MessageKind {
    fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// One logical message inside a batch.
#[derive(Debug, Clone)]
pub struct Message {
    pub seq_id: u64,
    pub kind: MessageKind,
    pub method: u32,
    pub data: SharedView,
}

/// Fixed bytes preceding each record's data.
const RECORD_HEADER: usize = 8 + 1 + 4 + 8;

impl Message {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER + self.data.len()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.seq_id);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.method);
        buf.put_u64_le(self.data.len() as u64);
        buf.put_slice(self.data.as_slice());
    }
}

/// Total encoding size of a batch.
#[must_use]
pub fn encoded_batch_len(items: &[Message]) -> usize {
    items.iter().map(Message::encoded_len).sum()
}

/// Encode all records back to back.
pub fn encode_batch(items: &[Message], buf: &mut impl BufMut) {
    for item in items {
        item.encode_into(buf);
    }
}

/// Decode a whole frame payload into its records.
///
/// Record data is a zero-copy slice of `frame`; holding a decoded message
/// keeps the frame's backing buffer alive.
pub fn decode_batch(frame: &SharedView) -> Result<Vec<Message>> {
    let slice = frame.as_slice();
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < slice.len() {
        if slice.len() - pos < RECORD_HEADER {
            return Err(CodecError::Truncated);
        }
        let mut cursor = &slice[pos..];
        let seq_id = cursor.get_u64_le();
        let kind = MessageKind::from_wire(cursor.get_u8())?;
        let method = cursor.get_u32_le();
        let data_len = cursor.get_u64_le() as usize;

        let data_start = pos + RECORD_HEADER;
        if data_len > slice.len() - data_start {
            return Err(CodecError::LengthOverrun);
        }
        items.push(Message {
            seq_id,
            kind,
            method,
            data: frame.slice(data_start, data_len),
        });
        pos = data_start + data_len;
    }
    Ok(items)
}

/// First frame on a fresh connection, sent by the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    /// The sender's listen port; combined with the peer address it
    /// resolves the sender's stable endpoint id.
    pub port: u16,
    /// Forced endpoint id override, when announced.
    pub endpoint_id: Option<u64>,
}

impl Greeting {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        3 + if self.endpoint_id.is_some() { 8 } else { 0 }
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.port);
        match self.endpoint_id {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u64_le(id);
            }
            None => buf.put_u8(0),
        }
    }

    /// Parse a greeting frame; the payload must be exactly one greeting.
    pub fn decode(frame: &SharedView) -> Result<Self> {
        let mut cursor = frame.as_slice();
        if cursor.len() < 3 {
            return Err(CodecError::MalformedGreeting);
        }
        let port = cursor.get_u16_le();
        let endpoint_id = match cursor.get_u8() {
            0 => None,
            1 => {
                if cursor.len() < 8 {
                    return Err(CodecError::MalformedGreeting);
                }
                Some(cursor.get_u64_le())
            }
            _ => return Err(CodecError::MalformedGreeting),
        };
        if !cursor.is_empty() {
            return Err(CodecError::MalformedGreeting);
        }
        Ok(Self { port, endpoint_id })
    }
}
