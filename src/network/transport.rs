//! Stream transport task
//!
//! Owns the single live connection to the server on a dedicated thread.
//! Incoming bytes are framed into whole messages (header first, then exactly
//! `payload_size` more bytes) and each message is copied once into the
//! shared chunked ring buffer. Queued outgoing messages are stamped and
//! written in the same loop.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::audio::buffer::SharedChunkedBuffer;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::network::signal::{Signal, SignalSet};
use crate::network::socket;
use crate::protocol::{MessageHeader, OutgoingMessage, MAX_MESSAGE_SIZE};
use crate::timestamp::Timestamp;

/// Commands accepted by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Stop,
    Disconnect,
    Connect,
}

impl Signal for TransportCommand {
    // Disconnect before Connect so a coalesced pair means "reconnect"
    const ALL: &'static [Self] = &[Self::Stop, Self::Disconnect, Self::Connect];

    fn mask(self) -> u32 {
        1 << self as u32
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Established,
    /// The connection could not be opened
    Failed(String),
    /// A read or write failed mid-session
    Dropped(String),
    /// Closed on request
    Closed,
    /// The transport thread is exiting
    TaskClosing,
}

/// Callback receiving lifecycle events on the transport thread
pub type EventSink = Box<dyn Fn(TransportEvent) + Send>;

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Longest a single socket read may block
    pub poll: Duration,
}

/// Transport counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    bytes: AtomicU64,
    sent: AtomicU64,
}

/// Handle to the transport thread
pub struct Transport {
    commands: Arc<SignalSet<TransportCommand>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Transport {
    /// Start the transport thread. It stays idle until told to connect.
    pub fn spawn(
        config: TransportConfig,
        rx_buffer: SharedChunkedBuffer,
        outgoing: Receiver<OutgoingMessage>,
        on_event: EventSink,
    ) -> Result<Self> {
        let commands = Arc::new(SignalSet::new());
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            commands: commands.clone(),
            counters: counters.clone(),
            rx_buffer,
            outgoing,
            on_event,
            stream: None,
            rx: vec![0; MessageHeader::SIZE],
            filled: 0,
            expected: None,
            tx: Vec::with_capacity(1024),
            config,
        };

        let running_for_loop = running.clone();
        let handle = thread::Builder::new()
            .name("snapcast-transport".into())
            .spawn(move || {
                worker.run();
                running_for_loop.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            commands,
            running,
            counters,
            thread_handle: Some(handle),
        })
    }

    /// Command channel, shared with the controller
    pub fn commands(&self) -> Arc<SignalSet<TransportCommand>> {
        self.commands.clone()
    }

    pub fn connect(&self) {
        self.commands.raise(TransportCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.commands.raise(TransportCommand::Disconnect);
    }

    /// Tear down the current connection and open a new one
    pub fn reconnect(&self) {
        self.commands
            .raise_all(&[TransportCommand::Disconnect, TransportCommand::Connect]);
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.commands.raise(TransportCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            messages_received: self.counters.received.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes.load(Ordering::Relaxed),
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the transport thread
struct Worker {
    config: TransportConfig,
    commands: Arc<SignalSet<TransportCommand>>,
    counters: Arc<Counters>,
    rx_buffer: SharedChunkedBuffer,
    outgoing: Receiver<OutgoingMessage>,
    on_event: EventSink,
    stream: Option<std::net::TcpStream>,
    /// Bytes of the message being assembled
    rx: Vec<u8>,
    filled: usize,
    /// Full message size once the header is complete
    expected: Option<usize>,
    tx: Vec<u8>,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!(
            "Transport task started for {}:{}",
            self.config.host,
            self.config.port
        );

        loop {
            let commands = if self.stream.is_some() {
                self.commands.take()
            } else {
                self.commands.wait(self.config.poll)
            };

            if commands.contains(TransportCommand::Stop) {
                self.close();
                break;
            }

            let reconnect = commands.contains(TransportCommand::Disconnect)
                && commands.contains(TransportCommand::Connect);

            if commands.contains(TransportCommand::Disconnect) && self.stream.is_some() {
                self.close();
                if !reconnect {
                    tracing::info!("Stream connection closed");
                    (self.on_event)(TransportEvent::Closed);
                }
            }

            if commands.contains(TransportCommand::Connect) {
                self.open();
            }

            if self.stream.is_some() {
                if let Err(e) = self.flush_outgoing().and_then(|_| self.read_step()) {
                    tracing::warn!("Stream connection dropped: {}", e);
                    self.close();
                    (self.on_event)(TransportEvent::Dropped(e.to_string()));
                }
            }
        }

        tracing::debug!("Transport task closing");
        (self.on_event)(TransportEvent::TaskClosing);
    }

    fn open(&mut self) {
        self.close();

        let result = socket::resolve(&self.config.host, self.config.port).and_then(|addr| {
            socket::connect(addr, self.config.connect_timeout, self.config.poll)
                .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))
        });

        match result {
            Ok(stream) => {
                // Messages queued for a previous connection are stale
                while self.outgoing.try_recv().is_ok() {}
                self.stream = Some(stream);
                tracing::info!(
                    "Connected to stream server {}:{}",
                    self.config.host,
                    self.config.port
                );
                (self.on_event)(TransportEvent::Established);
            }
            Err(e) => {
                tracing::warn!("{}", e);
                (self.on_event)(TransportEvent::Failed(e.to_string()));
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.filled = 0;
        self.expected = None;
    }

    fn flush_outgoing(&mut self) -> std::result::Result<(), NetworkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while let Ok(mut msg) = self.outgoing.try_recv() {
            msg.set_send_time();
            self.tx.clear();
            msg.write_to(&mut self.tx);
            stream
                .write_all(&self.tx)
                .map_err(|e| NetworkError::Dropped(format!("write failed: {}", e)))?;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// One bounded read; publishes the message once it is complete
    fn read_step(&mut self) -> std::result::Result<(), NetworkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let target = self.expected.unwrap_or(MessageHeader::SIZE);

        let n = match stream.read(&mut self.rx[self.filled..target]) {
            Ok(0) => return Err(NetworkError::Dropped("closed by server".into())),
            Ok(n) => n,
            Err(e) if socket::is_timeout(&e) => return Ok(()),
            Err(e) => return Err(NetworkError::Dropped(format!("read failed: {}", e))),
        };
        let arrived = Timestamp::now();
        self.filled += n;
        self.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);

        if self.expected.is_none() && self.filled == MessageHeader::SIZE {
            MessageHeader::stamp_received(&mut self.rx, arrived);
            let header = MessageHeader::from_bytes(&self.rx)
                .map_err(|e| NetworkError::Dropped(e.to_string()))?;
            let size = header.message_size();
            let limit = MAX_MESSAGE_SIZE.min(self.rx_buffer.capacity());
            if size > limit {
                return Err(NetworkError::Dropped(
                    ProtocolError::MessageTooLarge(size).to_string(),
                ));
            }
            if self.rx.len() < size {
                self.rx.resize(size, 0);
            }
            self.expected = Some(size);
        }

        if let Some(size) = self.expected.filter(|&size| size == self.filled) {
            self.publish(size);
            self.filled = 0;
            self.expected = None;
        }
        Ok(())
    }

    fn publish(&self, size: usize) {
        match self.rx_buffer.write(&self.rx[..size], Duration::ZERO) {
            Ok(_) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Stream buffer full, dropping {} byte message: {}", size, e);
            }
        }
    }
}
