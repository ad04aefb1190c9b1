//! Audio buffering subsystem
//!
//! Byte-chunk ring buffer between the transport and the controller, the
//! timed ring buffer between the controller and the playback sink, and the
//! sink boundary itself.

pub mod buffer;
pub mod sink;
pub mod timed;

pub use buffer::{
    create_shared_buffer, BufferStats, ChunkedRingBuffer, ReadChunk, SharedChunkedBuffer,
    WriteChunk,
};
pub use sink::{PlaybackSink, PlayoutPump, PumpStats, VolumeControl};
pub use timed::{
    create_shared_timed_buffer, SharedTimedBuffer, TimedRead, TimedRingBuffer, TimedWriteChunk,
};
