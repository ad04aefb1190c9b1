//! Playback collaborator boundary
//!
//! The engine never renders audio itself. A [`PlaybackSink`] receives chunk
//! payloads, and a [`PlayoutPump`] thread hands each chunk to the sink when its
//! local playout time arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::timed::{SharedTimedBuffer, TimedRead};
use crate::error::Result;
use crate::timestamp::Timestamp;

/// Destination for decoded-or-raw audio payloads
pub trait PlaybackSink: Send {
    /// Hand `samples` to the output; returns bytes accepted
    fn write(&mut self, samples: &[u8]) -> Result<usize>;

    /// Whether the sink still holds unplayed data
    fn has_buffered_data(&self) -> bool;

    /// Time between `write` and the samples becoming audible
    fn output_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Volume / mute hardware boundary
pub trait VolumeControl: Send + Sync {
    /// `volume` in 0.0..=1.0
    fn set_volume(&self, volume: f32);
    fn set_mute(&self, muted: bool);
}

/// Playout pump statistics
#[derive(Debug, Clone, Default)]
pub struct PumpStats {
    pub chunks_played: u64,
    pub chunks_late: u64,
    pub bytes_played: u64,
}

#[derive(Default)]
struct PumpCounters {
    played: AtomicU64,
    late: AtomicU64,
    bytes: AtomicU64,
}

/// Thread that drains a timed ring buffer into a sink at playout time
pub struct PlayoutPump {
    running: Arc<AtomicBool>,
    counters: Arc<PumpCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlayoutPump {
    /// Chunks later than this are discarded instead of played
    pub const LATE_TOLERANCE: Duration = Duration::from_millis(20);

    const READ_TIMEOUT: Duration = Duration::from_millis(50);
    const MAX_CHUNK: usize = 64 * 1024;

    /// Start pumping `buffer` into `sink` on a dedicated thread
    pub fn start<S: PlaybackSink + 'static>(buffer: SharedTimedBuffer, mut sink: S) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(PumpCounters::default());

        let running_for_loop = running.clone();
        let counters_for_loop = counters.clone();

        let handle = thread::Builder::new()
            .name("playout-pump".into())
            .spawn(move || {
                let mut scratch = vec![0u8; Self::MAX_CHUNK];
                while running_for_loop.load(Ordering::Relaxed) {
                    let (len, stamp) = match buffer.read(&mut scratch, Self::READ_TIMEOUT) {
                        TimedRead::Chunk { len, stamp } => (len, stamp),
                        TimedRead::Empty => continue,
                        TimedRead::TooSmall { needed } => {
                            tracing::warn!("Playout chunk of {} bytes exceeds scratch, growing", needed);
                            scratch.resize(needed, 0);
                            continue;
                        }
                    };

                    if !stamp.is_zero() {
                        let due = stamp - Timestamp::from_duration(sink.output_delay());
                        let lead = due - Timestamp::now();
                        if lead < Timestamp::ZERO - Timestamp::from_duration(Self::LATE_TOLERANCE) {
                            tracing::trace!("Dropping chunk {}ms late", -lead.to_millis());
                            counters_for_loop.late.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        if !Self::wait_until(due, &running_for_loop) {
                            tracing::debug!("Pump stopping, discarding pending chunk");
                            break;
                        }
                    }

                    match sink.write(&scratch[..len]) {
                        Ok(written) => {
                            counters_for_loop.played.fetch_add(1, Ordering::Relaxed);
                            counters_for_loop.bytes.fetch_add(written as u64, Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!("Playback sink write failed: {}", e),
                    }
                }
            })?;

        Ok(Self {
            running,
            counters,
            thread_handle: Some(handle),
        })
    }

    /// Sleep until `due` in slices of at most `READ_TIMEOUT`; false if the
    /// pump was stopped first
    fn wait_until(due: Timestamp, running: &AtomicBool) -> bool {
        loop {
            if !running.load(Ordering::Relaxed) {
                return false;
            }
            let lead = due - Timestamp::now();
            if lead <= Timestamp::ZERO {
                return true;
            }
            thread::sleep(lead.to_duration().min(Self::READ_TIMEOUT));
        }
    }

    /// Stop the pump thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            chunks_played: self.counters.played.load(Ordering::Relaxed),
            chunks_late: self.counters.late.load(Ordering::Relaxed),
            bytes_played: self.counters.bytes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PlayoutPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::timed::create_shared_timed_buffer;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    }

    impl PlaybackSink for RecordingSink {
        fn write(&mut self, samples: &[u8]) -> Result<usize> {
            self.writes.lock().push((Instant::now(), samples.to_vec()));
            Ok(samples.len())
        }

        fn has_buffered_data(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_pump_holds_chunk_until_playout_time() {
        let buffer = create_shared_timed_buffer(4096);
        let sink = RecordingSink::default();
        let writes = sink.writes.clone();

        let start = Instant::now();
        buffer
            .write(b"header", Timestamp::ZERO, Duration::ZERO)
            .unwrap();
        buffer
            .write(
                &[5; 32],
                Timestamp::now() + Timestamp::from_millis(60),
                Duration::ZERO,
            )
            .unwrap();

        let mut pump = PlayoutPump::start(buffer, sink).unwrap();
        thread::sleep(Duration::from_millis(200));
        pump.stop();

        let writes = writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"header");
        assert!(writes[1].0.duration_since(start) >= Duration::from_millis(50));
        assert_eq!(pump.stats().chunks_played, 2);
    }

    #[test]
    fn test_pump_drops_late_chunks() {
        let buffer = create_shared_timed_buffer(4096);
        let sink = RecordingSink::default();
        let writes = sink.writes.clone();

        buffer
            .write(
                &[1; 16],
                Timestamp::now() - Timestamp::from_millis(500),
                Duration::ZERO,
            )
            .unwrap();

        let mut pump = PlayoutPump::start(buffer, sink).unwrap();
        thread::sleep(Duration::from_millis(100));
        pump.stop();

        assert!(writes.lock().is_empty());
        assert_eq!(pump.stats().chunks_late, 1);
    }

    #[test]
    fn test_stop_does_not_wait_for_far_future_chunk() {
        let buffer = create_shared_timed_buffer(4096);
        let sink = RecordingSink::default();
        let writes = sink.writes.clone();

        buffer
            .write(
                &[5; 32],
                Timestamp::now() + Timestamp::from_millis(3000),
                Duration::ZERO,
            )
            .unwrap();

        let mut pump = PlayoutPump::start(buffer, sink).unwrap();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        pump.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!pump.is_running());
        assert!(writes.lock().is_empty());
        assert_eq!(pump.stats().chunks_played, 0);
    }
}
