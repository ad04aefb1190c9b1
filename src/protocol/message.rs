//! Typed message payloads
//!
//! [`Frame::decode`] is the single place where a received message is bounds
//! checked. It walks the payload forward once and borrows every variable
//! length field straight out of the ring-buffer chunk it was handed.

use std::borrow::Cow;

use crate::error::ProtocolError;
use crate::protocol::header::{MessageHeader, MessageType};
use crate::protocol::json::{self, ClientInfo, Hello, ServerSettings};
use crate::timestamp::Timestamp;

/// Decoder initialisation data that precedes the audio of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader<'a> {
    pub codec: Cow<'a, str>,
    pub payload: &'a [u8],
}

/// A block of audio tagged with its server-side capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireChunk<'a> {
    pub timestamp: Timestamp,
    pub payload: &'a [u8],
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum Message<'a> {
    CodecHeader(CodecHeader<'a>),
    WireChunk(WireChunk<'a>),
    /// Time-sync reply; `latency` is the client-to-server leg measured by the server
    Time { latency: Timestamp },
    ServerSettings {
        settings: ServerSettings,
        json: &'a [u8],
    },
    /// A known type the client only passes through (hello, tags, client info)
    Other {
        msg_type: MessageType,
        payload: &'a [u8],
    },
}

/// Header and body of one received message
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<'a> {
    pub header: MessageHeader,
    pub message: Message<'a>,
}

/// Forward-only bounds-checked reader
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn timestamp(&mut self) -> Result<Timestamp, ProtocolError> {
        let mut raw = [0u8; Timestamp::WIRE_SIZE];
        raw.copy_from_slice(self.take(Timestamp::WIRE_SIZE)?);
        Ok(Timestamp::from_le_bytes(raw))
    }

    /// `uint32 len` followed by `len` bytes
    fn sized(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

impl<'a> Frame<'a> {
    /// Decode one complete message (header + payload) from `bytes`
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = MessageHeader::from_bytes(bytes)?;
        let mut reader = Reader::new(&bytes[MessageHeader::SIZE..]);
        let payload = reader.take(header.payload_size as usize)?;
        let msg_type = header
            .message_type()
            .ok_or(ProtocolError::UnknownType(header.msg_type))?;

        let mut body = Reader::new(payload);
        let message = match msg_type {
            MessageType::CodecHeader => {
                let codec = String::from_utf8_lossy(body.sized()?);
                let payload = body.sized()?;
                Message::CodecHeader(CodecHeader { codec, payload })
            }
            MessageType::WireChunk => {
                let timestamp = body.timestamp()?;
                let payload = body.sized()?;
                Message::WireChunk(WireChunk { timestamp, payload })
            }
            MessageType::Time => Message::Time {
                latency: body.timestamp()?,
            },
            MessageType::ServerSettings => {
                let json = body.sized()?;
                Message::ServerSettings {
                    settings: json::decode(json)?,
                    json,
                }
            }
            other => Message::Other {
                msg_type: other,
                payload,
            },
        };
        Ok(Self { header, message })
    }

    /// Re-encode the frame in wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.message.payload_bytes();
        let mut header = self.header;
        header.payload_size = payload.len() as u32;
        let mut out = Vec::with_capacity(MessageHeader::SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        out
    }
}

impl Message<'_> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::CodecHeader(_) => MessageType::CodecHeader,
            Message::WireChunk(_) => MessageType::WireChunk,
            Message::Time { .. } => MessageType::Time,
            Message::ServerSettings { .. } => MessageType::ServerSettings,
            Message::Other { msg_type, .. } => *msg_type,
        }
    }

    /// Payload in wire layout
    pub fn payload_bytes(&self) -> Vec<u8> {
        match self {
            Message::CodecHeader(h) => codec_header_payload(&h.codec, h.payload),
            Message::WireChunk(c) => wire_chunk_payload(c.timestamp, c.payload),
            Message::Time { latency } => latency.to_le_bytes().to_vec(),
            Message::ServerSettings { json, .. } => sized_payload(json),
            Message::Other { payload, .. } => payload.to_vec(),
        }
    }
}

fn sized_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn codec_header_payload(codec: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = sized_payload(codec.as_bytes());
    out.extend_from_slice(&sized_payload(payload));
    out
}

fn wire_chunk_payload(timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut out = timestamp.to_le_bytes().to_vec();
    out.extend_from_slice(&sized_payload(payload));
    out
}

/// A message queued for the transport
///
/// `sent` is stamped by the transport through [`set_send_time`](Self::set_send_time)
/// right before the bytes reach the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    header: MessageHeader,
    payload: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            header: MessageHeader::new(msg_type, payload.len() as u32),
            payload,
        }
    }

    /// Time-sync request
    pub fn time() -> Self {
        Self::new(MessageType::Time, Timestamp::ZERO.to_le_bytes().to_vec())
    }

    pub fn hello(hello: &Hello) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Hello, hello)
    }

    pub fn client_info(info: ClientInfo) -> Result<Self, ProtocolError> {
        Self::json(MessageType::ClientInfo, &info)
    }

    pub fn server_settings(settings: &ServerSettings) -> Result<Self, ProtocolError> {
        Self::json(MessageType::ServerSettings, settings)
    }

    pub fn codec_header(codec: &str, payload: &[u8]) -> Self {
        Self::new(MessageType::CodecHeader, codec_header_payload(codec, payload))
    }

    pub fn wire_chunk(timestamp: Timestamp, payload: &[u8]) -> Self {
        Self::new(MessageType::WireChunk, wire_chunk_payload(timestamp, payload))
    }

    fn json<T: serde::Serialize>(msg_type: MessageType, value: &T) -> Result<Self, ProtocolError> {
        let json = serde_json::to_vec(value).map_err(|e| ProtocolError::Json(e.to_string()))?;
        Ok(Self::new(msg_type, sized_payload(&json)))
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.header.id = id;
        self
    }

    pub fn with_refers_to(mut self, refers_to: u16) -> Self {
        self.header.refers_to = refers_to;
        self
    }

    /// Stamp `sent` with the current time
    pub fn set_send_time(&mut self) {
        self.header.sent = Timestamp::now();
    }

    pub fn set_sent(&mut self, sent: Timestamp) {
        self.header.sent = sent;
    }

    pub fn set_received(&mut self, received: Timestamp) {
        self.header.received = received;
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }

    pub fn message_size(&self) -> usize {
        self.header.message_size()
    }

    /// Append the wire form to `dest`
    pub fn write_to(&self, dest: &mut Vec<u8>) {
        dest.extend_from_slice(&self.header.to_bytes());
        dest.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.message_size());
        self.write_to(&mut out);
        out
    }
}
