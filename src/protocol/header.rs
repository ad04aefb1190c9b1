//! Fixed-layout message header
//!
//! ```text
//! offset size field
//!      0    2 type
//!      2    2 id
//!      4    2 refersTo
//!      6    8 sent      (int32 sec, int32 usec)
//!     14    8 received  (int32 sec, int32 usec)
//!     22    4 payload_size
//! ```
//!
//! All integers are little-endian and the record is packed (26 bytes).

use crate::error::ProtocolError;
use crate::timestamp::Timestamp;

/// Wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Base = 0,
    CodecHeader = 1,
    WireChunk = 2,
    ServerSettings = 3,
    Time = 4,
    Hello = 5,
    StreamTags = 6,
    ClientInfo = 7,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Base,
            1 => Self::CodecHeader,
            2 => Self::WireChunk,
            3 => Self::ServerSettings,
            4 => Self::Time,
            5 => Self::Hello,
            6 => Self::StreamTags,
            7 => Self::ClientInfo,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_u16(value).ok_or(ProtocolError::UnknownType(value))
    }
}

/// Packed message header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Raw type value; unknown values are preserved for logging
    pub msg_type: u16,
    pub id: u16,
    pub refers_to: u16,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub payload_size: u32,
}

impl MessageHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 26;

    /// Byte range of the `received` field inside an encoded header
    pub const RECEIVED_RANGE: std::ops::Range<usize> = 14..22;

    pub fn new(msg_type: MessageType, payload_size: u32) -> Self {
        Self {
            msg_type: msg_type.as_u16(),
            payload_size,
            ..Default::default()
        }
    }

    /// Decode a header from the start of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: data.len(),
            });
        }
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        let tv_at = |at: usize| {
            let mut raw = [0u8; Timestamp::WIRE_SIZE];
            raw.copy_from_slice(&data[at..at + Timestamp::WIRE_SIZE]);
            Timestamp::from_le_bytes(raw)
        };
        Ok(Self {
            msg_type: u16_at(0),
            id: u16_at(2),
            refers_to: u16_at(4),
            sent: tv_at(6),
            received: tv_at(14),
            payload_size: u32::from_le_bytes([data[22], data[23], data[24], data[25]]),
        })
    }

    /// Encode into the first [`Self::SIZE`] bytes of `dest`
    pub fn write_to(&self, dest: &mut [u8]) {
        dest[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        dest[2..4].copy_from_slice(&self.id.to_le_bytes());
        dest[4..6].copy_from_slice(&self.refers_to.to_le_bytes());
        dest[6..14].copy_from_slice(&self.sent.to_le_bytes());
        dest[14..22].copy_from_slice(&self.received.to_le_bytes());
        dest[22..26].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        self.write_to(&mut out);
        out
    }

    /// Header plus payload
    pub fn message_size(&self) -> usize {
        Self::SIZE + self.payload_size as usize
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }

    /// Overwrite the `received` field of an already encoded header
    pub fn stamp_received(encoded: &mut [u8], received: Timestamp) {
        encoded[Self::RECEIVED_RANGE].copy_from_slice(&received.to_le_bytes());
    }
}
