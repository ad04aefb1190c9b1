//! Timed ring buffer
//!
//! Every chunk starts with the local playout timestamp it must be rendered
//! at. Chunks are delivered whole or not at all so a payload is never
//! separated from its timestamp.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{BufferStats, ChunkedRingBuffer, Fit, WriteChunk};
use crate::error::BufferError;
use crate::timestamp::Timestamp;

/// Size of the per-chunk timestamp header
pub const TIMED_HEADER_SIZE: usize = Timestamp::WIRE_SIZE;

/// Result of a timed read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedRead {
    /// A whole chunk was copied out
    Chunk { len: usize, stamp: Timestamp },
    /// The next chunk does not fit the destination. It stays queued and is
    /// delivered by the next read with a large enough buffer.
    TooSmall { needed: usize },
    /// Nothing arrived within the timeout
    Empty,
}

impl TimedRead {
    /// Legacy integer form: bytes copied, `0` when empty, `-1` when too small
    pub fn as_i32(&self) -> i32 {
        match self {
            TimedRead::Chunk { len, .. } => *len as i32,
            TimedRead::TooSmall { .. } => -1,
            TimedRead::Empty => 0,
        }
    }
}

/// Ring buffer of timestamped chunks feeding the playback sink
pub struct TimedRingBuffer {
    inner: ChunkedRingBuffer,
}

impl TimedRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ChunkedRingBuffer::with_chunk_header(capacity, TIMED_HEADER_SIZE),
        }
    }

    /// Reserve a chunk for `payload_size` bytes plus its timestamp header
    pub fn acquire_write(
        &self,
        payload_size: usize,
        timeout: Duration,
    ) -> Result<TimedWriteChunk<'_>, BufferError> {
        if payload_size == 0 {
            return Err(BufferError::InvalidSize(0));
        }
        let chunk = self
            .inner
            .acquire_write(payload_size + TIMED_HEADER_SIZE, timeout, false)?;
        Ok(TimedWriteChunk { chunk })
    }

    /// Copy `data` into a new chunk stamped with `stamp`
    pub fn write(
        &self,
        data: &[u8],
        stamp: Timestamp,
        timeout: Duration,
    ) -> Result<usize, BufferError> {
        let mut chunk = self.acquire_write(data.len(), timeout)?;
        chunk.set_stamp(stamp);
        chunk.copy_from_slice(data);
        chunk.complete();
        Ok(data.len())
    }

    /// Copy the next whole chunk into `dst` and report its playout time
    pub fn read(&self, dst: &mut [u8], timeout: Duration) -> TimedRead {
        match self.inner.next_chunk_fitting(dst.len(), timeout) {
            Fit::Chunk(chunk) => {
                let (header, payload) = chunk.split_at(TIMED_HEADER_SIZE);
                let mut raw = [0u8; TIMED_HEADER_SIZE];
                raw.copy_from_slice(header);
                dst[..payload.len()].copy_from_slice(payload);
                TimedRead::Chunk {
                    len: payload.len(),
                    stamp: Timestamp::from_le_bytes(raw),
                }
            }
            Fit::TooSmall { needed } => TimedRead::TooSmall { needed },
            Fit::Empty => TimedRead::Empty,
        }
    }

    /// Discard all pending chunks
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Payload bytes waiting to be played (timestamp headers excluded)
    pub fn bytes_available(&self) -> usize {
        self.inner.bytes_available()
    }

    pub fn chunks_available(&self) -> usize {
        self.inner.chunks_available()
    }

    /// Whether the sink still has something queued
    pub fn has_buffered_data(&self) -> bool {
        !self.inner.is_empty()
    }

    pub fn free(&self) -> usize {
        self.inner.free()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.stats()
    }
}

/// A reserved timed chunk; dropping it without completing abandons it
pub struct TimedWriteChunk<'a> {
    chunk: WriteChunk<'a>,
}

impl TimedWriteChunk<'_> {
    /// Set the local playout time. Zero means "play immediately".
    pub fn set_stamp(&mut self, stamp: Timestamp) {
        self.chunk[..TIMED_HEADER_SIZE].copy_from_slice(&stamp.to_le_bytes());
    }

    pub fn complete(self) {
        self.chunk.complete();
    }
}

impl Deref for TimedWriteChunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.chunk[TIMED_HEADER_SIZE..]
    }
}

impl DerefMut for TimedWriteChunk<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.chunk[TIMED_HEADER_SIZE..]
    }
}

/// Thread-safe handle to a timed ring buffer
pub type SharedTimedBuffer = Arc<TimedRingBuffer>;

pub fn create_shared_timed_buffer(capacity: usize) -> SharedTimedBuffer {
    Arc::new(TimedRingBuffer::new(capacity))
}
