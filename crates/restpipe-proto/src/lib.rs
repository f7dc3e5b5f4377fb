//! Wire protocol for the restpipe connection plane.
//!
//! A frame is a fixed 10-byte header followed by an opaque payload whose
//! schema is selected by the header's message type. Encoding and decoding
//! are pure; all I/O lives in `restpipe-core`.

mod wire;

use rand::Rng;
use thiserror::Error;

use crate::wire::FieldValue;

/// Exact size of the frame header on the wire.
pub const HEADER_LEN: usize = 10;

/// Header flag bit marking a frame as the reply to an earlier frame.
pub const FLAG_IS_REPLY: u8 = 0x01;

/// Protocol version carried in every payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lower bound of minted correlation IDs. Keeping IDs at or above this
/// floor fixes their decimal rendering at ten characters.
pub const CORRELATION_ID_FLOOR: u32 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("short frame header: {0} of {HEADER_LEN} bytes")]
    ShortHeader(usize),
    #[error("malformed {kind} payload: {detail}")]
    Malformed { kind: &'static str, detail: String },
}

fn malformed(kind: &'static str, detail: impl Into<String>) -> ProtoError {
    ProtoError::Malformed { kind, detail: detail.into() }
}

/// Message kinds fixed by this protocol release. The high bit marks the
/// reply kinds; the authoritative reply marker is the header flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0x01,
    Event = 0x02,
    HeartbeatReply = 0x80,
    EventReply = 0x81,
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Result<Self, ProtoError> {
        match raw {
            0x01 => Ok(Self::Heartbeat),
            0x02 => Ok(Self::Event),
            0x80 => Ok(Self::HeartbeatReply),
            0x81 => Ok(Self::EventReply),
            other => Err(ProtoError::UnknownType(other)),
        }
    }

    pub fn is_reply_kind(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

/// The fixed-size frame header, network byte order on the wire:
/// type, flags, payload length, correlation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub flags: u8,
    pub payload_len: u32,
    pub correlation_id: u32,
}

impl FrameHeader {
    pub fn new(
        message_type: MessageType,
        payload_len: u32,
        correlation_id: u32,
        is_reply: bool,
    ) -> Self {
        let flags = if is_reply { FLAG_IS_REPLY } else { 0 };
        Self { message_type, flags, payload_len, correlation_id }
    }

    /// True when either the flag bit or the type's high bit marks a reply.
    /// Both conventions are accepted on input; both are emitted on output.
    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_IS_REPLY != 0 || self.message_type.is_reply_kind()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.message_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[6..10].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::ShortHeader(buf.len()));
        }

        let message_type = MessageType::from_u8(buf[0])?;
        let payload_len =
            u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let correlation_id =
            u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);

        Ok(Self { message_type, flags: buf[1], payload_len, correlation_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub version: u32,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { version: PROTOCOL_VERSION }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatReply {
    pub version: u32,
}

impl HeartbeatReply {
    pub fn new() -> Self {
        Self { version: PROTOCOL_VERSION }
    }
}

impl Default for HeartbeatReply {
    fn default() -> Self {
        Self::new()
    }
}

/// A REST-style request carried over the pipe. The verb is an uppercase
/// HTTP-like method, the noun a path; data is opaque bytes whose meaning
/// follows the mimetype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub version: u32,
    pub verb: String,
    pub noun: String,
    pub mimetype: String,
    pub data: Vec<u8>,
}

/// The correlated answer to an [`Event`]. `code == 0` means success; any
/// other value is a handler-defined failure code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReply {
    pub version: u32,
    pub code: i32,
    pub mimetype: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat(Heartbeat),
    HeartbeatReply(HeartbeatReply),
    Event(Event),
    EventReply(EventReply),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::HeartbeatReply(_) => MessageType::HeartbeatReply,
            Self::Event(_) => MessageType::Event,
            Self::EventReply(_) => MessageType::EventReply,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Heartbeat(heartbeat) => {
                wire::put_uint_field(&mut buf, 1, u64::from(heartbeat.version));
            }
            Self::HeartbeatReply(reply) => {
                wire::put_uint_field(&mut buf, 1, u64::from(reply.version));
            }
            Self::Event(event) => {
                wire::put_uint_field(&mut buf, 1, u64::from(event.version));
                wire::put_len_field(&mut buf, 2, event.verb.as_bytes());
                wire::put_len_field(&mut buf, 3, event.noun.as_bytes());
                wire::put_len_field(&mut buf, 4, event.mimetype.as_bytes());
                wire::put_len_field(&mut buf, 5, &event.data);
            }
            Self::EventReply(reply) => {
                wire::put_uint_field(&mut buf, 1, u64::from(reply.version));
                wire::put_int32_field(&mut buf, 2, reply.code);
                wire::put_len_field(&mut buf, 3, reply.mimetype.as_bytes());
                wire::put_len_field(&mut buf, 4, &reply.data);
            }
        }
        buf
    }
}

/// Decodes a payload against the schema declared by `message_type`.
pub fn decode_payload(
    message_type: MessageType,
    bytes: &[u8],
) -> Result<Message, ProtoError> {
    match message_type {
        MessageType::Heartbeat => {
            let version = decode_version_only("heartbeat", bytes)?;
            Ok(Message::Heartbeat(Heartbeat { version }))
        }
        MessageType::HeartbeatReply => {
            let version = decode_version_only("heartbeat reply", bytes)?;
            Ok(Message::HeartbeatReply(HeartbeatReply { version }))
        }
        MessageType::Event => decode_event(bytes).map(Message::Event),
        MessageType::EventReply => {
            decode_event_reply(bytes).map(Message::EventReply)
        }
    }
}

fn decode_version_only(
    kind: &'static str,
    bytes: &[u8],
) -> Result<u32, ProtoError> {
    let mut version = 0u32;

    let mut decoder = wire::Decoder::new(bytes);
    while let Some((field, value)) =
        decoder.next_field().map_err(|detail| malformed(kind, detail))?
    {
        match (field, value) {
            (1, FieldValue::Varint(raw)) => {
                version = varint_to_u32(kind, "version", raw)?;
            }
            (1, _) => {
                return Err(malformed(kind, "version is not a varint"));
            }
            _ => {}
        }
    }

    Ok(version)
}

fn decode_event(bytes: &[u8]) -> Result<Event, ProtoError> {
    const KIND: &str = "event";

    let mut event = Event {
        version: 0,
        verb: String::new(),
        noun: String::new(),
        mimetype: String::new(),
        data: Vec::new(),
    };

    let mut decoder = wire::Decoder::new(bytes);
    while let Some((field, value)) =
        decoder.next_field().map_err(|detail| malformed(KIND, detail))?
    {
        match (field, value) {
            (1, FieldValue::Varint(raw)) => {
                event.version = varint_to_u32(KIND, "version", raw)?;
            }
            (2, FieldValue::Bytes(raw)) => {
                event.verb = bytes_to_string(KIND, "verb", raw)?;
            }
            (3, FieldValue::Bytes(raw)) => {
                event.noun = bytes_to_string(KIND, "noun", raw)?;
            }
            (4, FieldValue::Bytes(raw)) => {
                event.mimetype = bytes_to_string(KIND, "mimetype", raw)?;
            }
            (5, FieldValue::Bytes(raw)) => {
                event.data = raw.to_vec();
            }
            (1..=5, _) => {
                return Err(malformed(KIND, format!(
                    "field {field} has the wrong wire type"
                )));
            }
            _ => {}
        }
    }

    Ok(event)
}

fn decode_event_reply(bytes: &[u8]) -> Result<EventReply, ProtoError> {
    const KIND: &str = "event reply";

    let mut reply = EventReply {
        version: 0,
        code: 0,
        mimetype: String::new(),
        data: Vec::new(),
    };

    let mut decoder = wire::Decoder::new(bytes);
    while let Some((field, value)) =
        decoder.next_field().map_err(|detail| malformed(KIND, detail))?
    {
        match (field, value) {
            (1, FieldValue::Varint(raw)) => {
                reply.version = varint_to_u32(KIND, "version", raw)?;
            }
            (2, FieldValue::Varint(raw)) => {
                let wide = raw as i64;
                reply.code =
                    i32::try_from(wide).map_err(|_| {
                        malformed(KIND, format!("code {wide} out of range"))
                    })?;
            }
            (3, FieldValue::Bytes(raw)) => {
                reply.mimetype = bytes_to_string(KIND, "mimetype", raw)?;
            }
            (4, FieldValue::Bytes(raw)) => {
                reply.data = raw.to_vec();
            }
            (1..=4, _) => {
                return Err(malformed(KIND, format!(
                    "field {field} has the wrong wire type"
                )));
            }
            _ => {}
        }
    }

    Ok(reply)
}

fn varint_to_u32(
    kind: &'static str,
    name: &str,
    raw: u64,
) -> Result<u32, ProtoError> {
    u32::try_from(raw)
        .map_err(|_| malformed(kind, format!("{name} {raw} out of range")))
}

fn bytes_to_string(
    kind: &'static str,
    name: &str,
    raw: &[u8],
) -> Result<String, ProtoError> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| malformed(kind, format!("{name} is not valid UTF-8")))
}

/// Mints a fresh correlation ID in `[10^9, 2^32)`. The floor keeps the
/// decimal rendering at a fixed ten characters and pushes the collision
/// window far out.
pub fn mint_correlation_id() -> u32 {
    rand::thread_rng().gen_range(CORRELATION_ID_FLOOR..=u32::MAX)
}

/// Renders a correlation ID the way the logs expect it: ten digits.
pub fn correlation_id_str(correlation_id: u32) -> String {
    format!("{correlation_id:010}")
}
