//! Chunked ring buffer for framed stream data
//!
//! A fixed-capacity arena that stores variable-length chunks. The producer
//! reserves a chunk, fills it in place and publishes it; the consumer takes
//! whole chunks in publication order without copying, or copies bytes out
//! through a cursor that can stop in the middle of a chunk.
//!
//! Only single-producer single-consumer use is supported.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BufferError;

/// Reader cursor over a partially consumed chunk
struct Cursor {
    data: Bytes,
    pos: usize,
    reserved: usize,
}

struct Inner {
    /// Completed, unread chunks in publication order
    chunks: VecDeque<Bytes>,
    /// Bytes reserved by pending writes, queued chunks and chunks held by the reader
    in_use: usize,
    /// Set while the producer holds an acquired chunk
    write_pending: bool,
    /// Readable payload bytes (chunk headers excluded)
    bytes_available: usize,
    cursor: Option<Cursor>,
}

/// Outcome of a size-checked pop, used by the timed specialization
pub(crate) enum Fit<'a> {
    Chunk(ReadChunk<'a>),
    TooSmall { needed: usize },
    Empty,
}

/// Fixed-capacity chunk arena
pub struct ChunkedRingBuffer {
    capacity: usize,
    /// Bytes at the start of each chunk that are not counted as payload
    chunk_header_size: usize,
    inner: Mutex<Inner>,
    space_freed: Condvar,
    chunk_published: Condvar,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
    discarded_count: AtomicUsize,
}

impl ChunkedRingBuffer {
    /// Create a new buffer able to hold `capacity` bytes of chunks
    pub fn new(capacity: usize) -> Self {
        Self::with_chunk_header(capacity, 0)
    }

    /// Create a buffer whose chunks start with a fixed-size header that is
    /// excluded from [`bytes_available`](Self::bytes_available)
    pub fn with_chunk_header(capacity: usize, chunk_header_size: usize) -> Self {
        Self {
            capacity,
            chunk_header_size,
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                in_use: 0,
                write_pending: false,
                bytes_available: 0,
                cursor: None,
            }),
            space_freed: Condvar::new(),
            chunk_published: Condvar::new(),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
            discarded_count: AtomicUsize::new(0),
        }
    }

    /// Reserve `size` contiguous bytes for the producer.
    ///
    /// Waits up to `timeout` for space. With `discard_oldest`, a failed wait
    /// drops the oldest unread chunk and retries once.
    pub fn acquire_write(
        &self,
        size: usize,
        timeout: Duration,
        discard_oldest: bool,
    ) -> Result<WriteChunk<'_>, BufferError> {
        if size == 0 || size > self.capacity {
            return Err(BufferError::InvalidSize(size));
        }

        let mut inner = self.inner.lock();
        if inner.write_pending {
            return Err(BufferError::Busy);
        }

        if !self.wait_for_space(&mut inner, size, timeout) {
            if !discard_oldest || !self.discard_front(&mut inner) {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                return Err(BufferError::Timeout);
            }
            if !self.wait_for_space(&mut inner, size, timeout) {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                return Err(BufferError::Timeout);
            }
        }

        inner.in_use += size;
        inner.write_pending = true;
        drop(inner);

        Ok(WriteChunk {
            buffer: self,
            data: BytesMut::zeroed(size),
            completed: false,
        })
    }

    fn wait_for_space(
        &self,
        inner: &mut parking_lot::MutexGuard<'_, Inner>,
        size: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while inner.in_use + size > self.capacity {
            if self.space_freed.wait_until(inner, deadline).timed_out() {
                return inner.in_use + size <= self.capacity;
            }
        }
        true
    }

    fn discard_front(&self, inner: &mut Inner) -> bool {
        match inner.chunks.pop_front() {
            Some(chunk) => {
                inner.in_use -= chunk.len();
                inner.bytes_available -= self.payload_len(chunk.len());
                self.discarded_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn payload_len(&self, chunk_len: usize) -> usize {
        chunk_len.saturating_sub(self.chunk_header_size)
    }

    fn publish(&self, data: Bytes) {
        let mut inner = self.inner.lock();
        inner.write_pending = false;
        inner.bytes_available += self.payload_len(data.len());
        inner.chunks.push_back(data);
        drop(inner);
        self.chunk_published.notify_one();
    }

    fn abandon(&self, reserved: usize) {
        let mut inner = self.inner.lock();
        inner.write_pending = false;
        inner.in_use -= reserved;
        drop(inner);
        self.space_freed.notify_one();
    }

    fn release(&self, reserved: usize) {
        let mut inner = self.inner.lock();
        inner.in_use -= reserved;
        drop(inner);
        self.space_freed.notify_one();
    }

    /// Copy `data` into a fresh chunk and publish it.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, BufferError> {
        let mut chunk = self.acquire_write(data.len(), timeout, false)?;
        chunk.copy_from_slice(data);
        chunk.complete();
        Ok(data.len())
    }

    /// Pop the next complete chunk without copying.
    ///
    /// If a partial read is in progress, the unread remainder of that chunk is
    /// returned first. The space is given back when the returned chunk drops.
    pub fn get_next_chunk(&self, timeout: Duration) -> Option<ReadChunk<'_>> {
        let mut inner = self.inner.lock();

        if let Some(cursor) = inner.cursor.take() {
            let remaining = cursor.data.slice(cursor.pos..);
            inner.bytes_available -= remaining.len();
            return Some(ReadChunk {
                buffer: self,
                data: remaining,
                reserved: cursor.reserved,
            });
        }

        let deadline = Instant::now() + timeout;
        while inner.chunks.is_empty() {
            if self.chunk_published.wait_until(&mut inner, deadline).timed_out()
                && inner.chunks.is_empty()
            {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let data = inner.chunks.pop_front()?;
        inner.bytes_available -= self.payload_len(data.len());
        let reserved = data.len();
        Some(ReadChunk {
            buffer: self,
            data,
            reserved,
        })
    }

    /// Pop the next chunk only if its payload fits in `max_len` bytes.
    ///
    /// An oversized chunk stays at the front of the queue.
    pub(crate) fn next_chunk_fitting(&self, max_len: usize, timeout: Duration) -> Fit<'_> {
        let mut inner = self.inner.lock();

        let deadline = Instant::now() + timeout;
        while inner.chunks.is_empty() {
            if self.chunk_published.wait_until(&mut inner, deadline).timed_out()
                && inner.chunks.is_empty()
            {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                return Fit::Empty;
            }
        }

        let needed = match inner.chunks.front() {
            Some(front) => self.payload_len(front.len()),
            None => return Fit::Empty,
        };
        if needed > max_len {
            return Fit::TooSmall { needed };
        }

        match inner.chunks.pop_front() {
            Some(data) => {
                inner.bytes_available -= needed;
                let reserved = data.len();
                Fit::Chunk(ReadChunk {
                    buffer: self,
                    data,
                    reserved,
                })
            }
            None => Fit::Empty,
        }
    }

    /// Copy up to `dst.len()` bytes out of the current (or next) chunk only.
    pub fn read_up_to(&self, dst: &mut [u8], timeout: Duration) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();

        if inner.cursor.is_none() {
            let deadline = Instant::now() + timeout;
            while inner.chunks.is_empty() {
                if self.chunk_published.wait_until(&mut inner, deadline).timed_out()
                    && inner.chunks.is_empty()
                {
                    return 0;
                }
            }
            let Some(data) = inner.chunks.pop_front() else {
                return 0;
            };
            let reserved = data.len();
            inner.cursor = Some(Cursor {
                data,
                pos: 0,
                reserved,
            });
        }

        let Some(cursor) = inner.cursor.as_mut() else {
            return 0;
        };
        let remaining = cursor.data.len() - cursor.pos;
        let n = remaining.min(dst.len());
        dst[..n].copy_from_slice(&cursor.data[cursor.pos..cursor.pos + n]);
        cursor.pos += n;

        let finished = cursor.pos == cursor.data.len();
        let reserved = cursor.reserved;
        inner.bytes_available -= n;
        if finished {
            inner.cursor = None;
            inner.in_use -= reserved;
            drop(inner);
            self.space_freed.notify_one();
        }
        n
    }

    /// Copy bytes out, continuing across chunk boundaries until `dst` is full
    /// or no further chunk arrives within `timeout`.
    pub fn read(&self, dst: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut copied = 0;
        while copied < dst.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = self.read_up_to(&mut dst[copied..], remaining);
            if n == 0 {
                break;
            }
            copied += n;
        }
        copied
    }

    /// Discard every unread chunk, including a partially read one.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.cursor.take() {
            inner.in_use -= cursor.reserved;
        }
        let freed: usize = inner.chunks.drain(..).map(|c| c.len()).sum();
        inner.in_use -= freed;
        inner.bytes_available = 0;
        drop(inner);
        self.space_freed.notify_all();
    }

    /// Readable payload bytes
    pub fn bytes_available(&self) -> usize {
        self.inner.lock().bytes_available
    }

    /// Number of complete chunks waiting to be read
    pub fn chunks_available(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    /// Bytes that can be reserved right now without waiting
    pub fn free(&self) -> usize {
        self.capacity - self.inner.lock().in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.chunks.is_empty() && inner.cursor.is_none()
    }

    /// Get statistics
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            capacity: self.capacity,
            in_use: inner.in_use,
            chunks: inner.chunks.len(),
            bytes_available: inner.bytes_available,
            overflows: self.overflow_count.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
            discarded: self.discarded_count.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.overflow_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.discarded_count.store(0, Ordering::Relaxed);
    }
}

/// A reserved, not yet published chunk. Dropping it without calling
/// [`complete`](WriteChunk::complete) abandons the reservation.
pub struct WriteChunk<'a> {
    buffer: &'a ChunkedRingBuffer,
    data: BytesMut,
    completed: bool,
}

impl WriteChunk<'_> {
    /// Publish the chunk to the reader
    pub fn complete(mut self) {
        self.completed = true;
        let data = std::mem::take(&mut self.data).freeze();
        self.buffer.publish(data);
    }
}

impl Deref for WriteChunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for WriteChunk<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for WriteChunk<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.buffer.abandon(self.data.len());
        }
    }
}

/// A chunk handed to the reader. Its space returns to the arena on drop.
pub struct ReadChunk<'a> {
    buffer: &'a ChunkedRingBuffer,
    data: Bytes,
    reserved: usize,
}

impl ReadChunk<'_> {
    /// Give the chunk back explicitly
    pub fn release(self) {}

    /// Take a cheap reference-counted view of the chunk contents
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Deref for ReadChunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for ReadChunk<'_> {
    fn drop(&mut self) {
        self.buffer.release(self.reserved);
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub capacity: usize,
    pub in_use: usize,
    pub chunks: usize,
    pub bytes_available: usize,
    pub overflows: usize,
    pub underruns: usize,
    pub discarded: usize,
}

impl BufferStats {
    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.in_use as f32 / self.capacity as f32
    }
}

/// Thread-safe handle to a chunked ring buffer
pub type SharedChunkedBuffer = Arc<ChunkedRingBuffer>;

/// Create a new shared chunked ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedChunkedBuffer {
    Arc::new(ChunkedRingBuffer::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn test_acquire_complete_read() {
        let buffer = ChunkedRingBuffer::new(64);

        let mut chunk = buffer.acquire_write(5, NO_WAIT, false).unwrap();
        chunk.copy_from_slice(b"hello");
        assert_eq!(buffer.bytes_available(), 0);
        chunk.complete();

        assert_eq!(buffer.bytes_available(), 5);
        assert_eq!(buffer.chunks_available(), 1);

        let read = buffer.get_next_chunk(NO_WAIT).unwrap();
        assert_eq!(&*read, b"hello");
        assert_eq!(buffer.free(), 59);
        read.release();
        assert_eq!(buffer.free(), 64);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_single_pending_writer() {
        let buffer = ChunkedRingBuffer::new(64);
        let first = buffer.acquire_write(4, NO_WAIT, false).unwrap();
        assert_eq!(
            buffer.acquire_write(4, NO_WAIT, false).err(),
            Some(BufferError::Busy)
        );
        drop(first);
        // Abandoned chunk gives its space back and never becomes readable
        assert_eq!(buffer.free(), 64);
        assert!(buffer.get_next_chunk(NO_WAIT).is_none());
        assert!(buffer.acquire_write(4, NO_WAIT, false).is_ok());
    }

    #[test]
    fn test_invalid_sizes() {
        let buffer = ChunkedRingBuffer::new(16);
        assert_eq!(
            buffer.acquire_write(0, NO_WAIT, false).err(),
            Some(BufferError::InvalidSize(0))
        );
        assert_eq!(
            buffer.acquire_write(17, NO_WAIT, false).err(),
            Some(BufferError::InvalidSize(17))
        );
    }

    #[test]
    fn test_full_buffer_times_out() {
        let buffer = ChunkedRingBuffer::new(16);
        buffer.write(&[1; 12], NO_WAIT).unwrap();
        let result = buffer.acquire_write(8, Duration::from_millis(10), false);
        assert_eq!(result.err(), Some(BufferError::Timeout));
        assert_eq!(buffer.stats().overflows, 1);
    }

    #[test]
    fn test_discard_oldest_policy() {
        let buffer = ChunkedRingBuffer::new(16);
        buffer.write(&[1; 8], NO_WAIT).unwrap();
        buffer.write(&[2; 8], NO_WAIT).unwrap();

        let mut chunk = buffer.acquire_write(8, NO_WAIT, true).unwrap();
        chunk.copy_from_slice(&[3; 8]);
        chunk.complete();

        assert_eq!(buffer.stats().discarded, 1);
        assert_eq!(&*buffer.get_next_chunk(NO_WAIT).unwrap(), &[2; 8]);
        assert_eq!(&*buffer.get_next_chunk(NO_WAIT).unwrap(), &[3; 8]);
    }

    #[test]
    fn test_partial_reads_resume_mid_chunk() {
        let buffer = ChunkedRingBuffer::new(64);
        buffer.write(b"abcdef", NO_WAIT).unwrap();
        buffer.write(b"ghij", NO_WAIT).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out, NO_WAIT), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buffer.bytes_available(), 6);

        let mut out = [0u8; 5];
        assert_eq!(buffer.read(&mut out, NO_WAIT), 5);
        assert_eq!(&out, b"efghi");

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out, NO_WAIT), 1);
        assert_eq!(out[0], b'j');
        assert_eq!(buffer.free(), 64);
    }

    #[test]
    fn test_next_chunk_returns_cursor_remainder_first() {
        let buffer = ChunkedRingBuffer::new(64);
        buffer.write(b"abcdef", NO_WAIT).unwrap();
        buffer.write(b"xyz", NO_WAIT).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(buffer.read_up_to(&mut out, NO_WAIT), 2);
        assert_eq!(&*buffer.get_next_chunk(NO_WAIT).unwrap(), b"cdef");
        assert_eq!(&*buffer.get_next_chunk(NO_WAIT).unwrap(), b"xyz");
        assert_eq!(buffer.free(), 64);
    }

    #[test]
    fn test_reset_discards_everything() {
        let buffer = ChunkedRingBuffer::new(64);
        buffer.write(b"abcdef", NO_WAIT).unwrap();
        buffer.write(b"ghij", NO_WAIT).unwrap();
        let mut out = [0u8; 3];
        buffer.read_up_to(&mut out, NO_WAIT);

        buffer.reset();
        assert_eq!(buffer.bytes_available(), 0);
        assert_eq!(buffer.free(), 64);
        assert!(buffer.get_next_chunk(NO_WAIT).is_none());
    }

    #[test]
    fn test_blocked_writer_wakes_when_reader_releases() {
        let buffer = create_shared_buffer(16);
        buffer.write(&[7; 16], NO_WAIT).unwrap();

        let reader = buffer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let chunk = reader.get_next_chunk(Duration::from_secs(1)).unwrap();
            assert_eq!(chunk.len(), 16);
        });

        let chunk = buffer.acquire_write(16, Duration::from_secs(2), false);
        assert!(chunk.is_ok());
        drop(chunk);
        handle.join().unwrap();
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        let buffer = create_shared_buffer(256);
        let producer = buffer.clone();

        let handle = thread::spawn(move || {
            for i in 0..500u32 {
                let len = (i % 23 + 1) as usize;
                let mut chunk = producer
                    .acquire_write(len, Duration::from_secs(1), false)
                    .unwrap();
                chunk.fill(i as u8);
                chunk.complete();
            }
        });

        for i in 0..500u32 {
            let chunk = buffer.get_next_chunk(Duration::from_secs(1)).unwrap();
            assert_eq!(chunk.len(), (i % 23 + 1) as usize);
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
        handle.join().unwrap();
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunks_read_back_in_write_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..32)
        ) {
            let buffer = ChunkedRingBuffer::new(4096);
            for chunk in &chunks {
                buffer.write(chunk, NO_WAIT).unwrap();
            }
            let total: usize = chunks.iter().map(Vec::len).sum();
            prop_assert_eq!(buffer.bytes_available(), total);

            for chunk in &chunks {
                let read = buffer.get_next_chunk(NO_WAIT).unwrap();
                prop_assert_eq!(&*read, chunk.as_slice());
            }
            prop_assert!(buffer.get_next_chunk(NO_WAIT).is_none());
        }
    }
}
