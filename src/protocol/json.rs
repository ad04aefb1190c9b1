//! JSON documents carried by Hello, ClientInfo and ServerSettings messages

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Stream protocol version announced in the hello message
pub const STREAM_PROTOCOL_VERSION: u32 = 2;

/// Client identification sent after every connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hello {
    pub arch: String,
    pub client_name: String,
    pub host_name: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub instance: u32,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub snap_stream_protocol_version: u32,
    pub version: String,
}

impl Hello {
    pub fn new(client_name: &str, host_name: &str, id: &str, instance: u32) -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            client_name: client_name.to_string(),
            host_name: host_name.to_string(),
            id: id.to_string(),
            instance,
            mac: id.to_string(),
            os: std::env::consts::OS.to_string(),
            snap_stream_protocol_version: STREAM_PROTOCOL_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Volume / mute report sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub volume: u8,
    pub muted: bool,
}

/// Playback settings pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(rename = "bufferMs")]
    pub buffer_ms: i32,
    pub latency: i32,
    pub volume: u16,
    pub muted: bool,
}

/// Decode a JSON document, mapping failures to a protocol error
pub fn decode<'a, T: Deserialize<'a>>(json: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(json).map_err(|e| ProtocolError::Json(e.to_string()))
}
