//! # Snapstream Client
//!
//! Protocol engine for a Snapcast-compatible synchronized audio client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            SNAPCAST SERVER                               │
//! │        stream port (binary, 1704)            control port (JSON-RPC, 1705)│
//! └───────────────┬──────────────────────────────────────────┬───────────────┘
//!                 │ TCP                                      │ TCP
//!                 ▼                                          ▼
//! ┌───────────────────────────────┐          ┌───────────────────────────────┐
//! │ Transport (network::transport)│          │ ControlSession (rpc::session) │
//! │  header-then-payload framing  │          │  line-delimited JSON-RPC      │
//! │  stamps `received` at header  │          │  assigned stream status       │
//! └───────┬───────────────▲───────┘          └───────────────┬───────────────┘
//!         │ chunks        │ outgoing queue                   │ PlaybackDecision
//!         ▼               │                                  ▼
//! ┌──────────────────┐    │                       ┌──────────────────────────┐
//! │ChunkedRingBuffer │    │                       │   SnapClient (client)    │
//! └───────┬──────────┘    │                       │ volume, start/stop glue  │
//!         ▼               │                       └──────────────────────────┘
//! ┌─────────────────────────────────────────┐
//! │  StreamController (stream::controller)  │
//! │  time sync ─► TimeStats (clock)         │
//! │  server time ─► local playout time      │
//! └───────┬─────────────────────────────────┘
//!         ▼
//! ┌──────────────────┐    ┌─────────────────────────────┐
//! │ TimedRingBuffer  │───►│ PlayoutPump ─► PlaybackSink │
//! └──────────────────┘    └─────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod rpc;
pub mod stream;
pub mod timestamp;
pub mod url;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default Snapcast binary stream port
    pub const DEFAULT_STREAM_PORT: u16 = 1704;

    /// Default Snapcast JSON-RPC control port
    pub const DEFAULT_RPC_PORT: u16 = 1705;

    /// Capacity of the ring buffer between transport and controller
    pub const STREAM_BUFFER_BYTES: usize = 256 * 1024;

    /// Capacity of the timed playout buffer
    pub const PLAYOUT_BUFFER_BYTES: usize = 512 * 1024;

    /// Messages the controller may queue ahead of the transport
    pub const OUTGOING_QUEUE_LEN: usize = 10;
}
