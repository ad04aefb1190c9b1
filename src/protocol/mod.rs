//! Binary stream protocol
//!
//! Every message is a packed 26-byte [`MessageHeader`] followed by
//! `payload_size` bytes whose layout depends on the message type.

pub mod header;
pub mod json;
pub mod message;

pub use header::{MessageHeader, MessageType};
pub use json::{ClientInfo, Hello, ServerSettings};
pub use message::{CodecHeader, Frame, Message, OutgoingMessage, WireChunk};

/// Largest message the client accepts from the server
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
