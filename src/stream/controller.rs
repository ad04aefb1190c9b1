//! Stream controller state machine
//!
//! Consumes control commands and transport events, keeps the clock offset
//! estimate fed with time-sync round trips and classifies the framed
//! messages the transport leaves in the chunked ring buffer. Audio chunks
//! are re-stamped with their local playout time and handed to the timed
//! ring buffer read by the playback sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::audio::buffer::SharedChunkedBuffer;
use crate::audio::timed::SharedTimedBuffer;
use crate::clock::TimeStats;
use crate::config::{ClockConfig, StreamConfig};
use crate::error::{NetworkError, ProtocolError};
use crate::network::signal::{Mailbox, Signal, SignalSet};
use crate::network::transport::{TransportCommand, TransportEvent};
use crate::protocol::{
    ClientInfo, CodecHeader, Frame, Hello, Message, MessageHeader, MessageType, OutgoingMessage,
    ServerSettings, WireChunk,
};
use crate::stream::state::{StatusCallback, StreamState, StreamStatus};
use crate::timestamp::Timestamp;

/// Commands accepted by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Connect,
    Disconnect,
    Stop,
    StartStream,
    StopStream,
    SendReport,
    /// Wake-up only: transport events are waiting in the event channel
    TransportEvent,
}

impl Signal for StreamCommand {
    const ALL: &'static [Self] = &[
        Self::Connect,
        Self::Disconnect,
        Self::Stop,
        Self::StartStream,
        Self::StopStream,
        Self::SendReport,
        Self::TransportEvent,
    ];

    fn mask(self) -> u32 {
        1 << self as u32
    }
}

/// Why a message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotStreaming,
    NoCodecHeader,
    ClockNotReady,
    TooLate,
    PlayoutFull,
    Malformed,
}

/// What one classification step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// No message arrived within the wait
    Nothing,
    TimeSync,
    ServerSettings,
    CodecHeader,
    /// Audio queued for playout at the given local time
    Scheduled(Timestamp),
    Dropped(DropReason),
    Ignored(MessageType),
    /// The stream was declared broken
    Failed(String),
}

/// Shared endpoints the controller works with
pub struct ControllerLinks {
    pub rx_buffer: SharedChunkedBuffer,
    pub playout: SharedTimedBuffer,
    pub outgoing: Sender<OutgoingMessage>,
    pub transport: Arc<SignalSet<TransportCommand>>,
    /// Latest volume report requested by the application
    pub report: Arc<Mailbox<ClientInfo>>,
    pub status: Arc<Mailbox<StreamStatus>>,
}

pub struct StreamController {
    config: StreamConfig,
    hello: Hello,
    links: ControllerLinks,
    on_status: Option<StatusCallback>,

    state: StreamState,
    time_stats: TimeStats,
    server_settings: Option<ServerSettings>,
    codec_header_sent: bool,
    start_after_connecting: bool,
    last_time_sync: Option<Instant>,
    time_sync_id: u16,
    framing_errors: u32,
    reconnect_at: Option<Instant>,
    error: Option<String>,
    outgoing_dropped: u64,
    finished: bool,
}

impl StreamController {
    /// Outer loop wait while audio is flowing
    pub const STREAMING_WAIT: Duration = Duration::from_millis(5);
    /// Outer loop wait otherwise
    pub const IDLE_WAIT: Duration = Duration::from_millis(100);

    pub fn new(
        config: StreamConfig,
        clock: &ClockConfig,
        hello: Hello,
        links: ControllerLinks,
    ) -> Self {
        Self {
            config,
            hello,
            links,
            on_status: None,
            state: StreamState::Disconnected,
            time_stats: TimeStats::from_config(clock),
            server_settings: None,
            codec_header_sent: false,
            start_after_connecting: false,
            last_time_sync: None,
            time_sync_id: 0,
            framing_errors: 0,
            reconnect_at: None,
            error: None,
            outgoing_dropped: 0,
            finished: false,
        }
    }

    pub fn set_status_callback(&mut self, callback: StatusCallback) {
        self.on_status = Some(callback);
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn time_stats(&self) -> &TimeStats {
        &self.time_stats
    }

    pub fn server_settings(&self) -> Option<ServerSettings> {
        self.server_settings
    }

    /// Reason for the last transition into [`StreamState::Error`]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Messages discarded because the outgoing queue was full
    pub fn outgoing_dropped(&self) -> u64 {
        self.outgoing_dropped
    }

    /// Whether the transport has shut down and the loop should exit
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drive the controller until the transport task closes
    pub fn run(mut self, commands: Arc<SignalSet<StreamCommand>>, events: Receiver<TransportEvent>) {
        tracing::debug!("Stream controller started");
        while !self.finished {
            let wait = if self.state == StreamState::Streaming {
                Self::STREAMING_WAIT
            } else {
                Self::IDLE_WAIT
            };

            // While connected the ring-buffer pop below is the blocking point
            let signals = if self.state.is_connected() {
                commands.take()
            } else {
                commands.wait(wait)
            };
            for command in signals.iter() {
                if command != StreamCommand::TransportEvent {
                    self.handle_command(command);
                }
            }
            while let Ok(event) = events.try_recv() {
                self.handle_event(event);
            }

            self.poll(Instant::now());
            if self.state.is_connected() {
                self.process_next_message(wait);
            }
        }
        tracing::debug!("Stream controller finished");
    }

    pub fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Connect => {
                self.error = None;
                self.reconnect_at = None;
                self.set_state(StreamState::Connecting);
                self.links.transport.raise(TransportCommand::Connect);
            }
            StreamCommand::Disconnect => {
                self.start_after_connecting = false;
                self.reconnect_at = None;
                self.links.transport.raise(TransportCommand::Disconnect);
                self.set_state(StreamState::Disconnected);
            }
            StreamCommand::Stop => {
                self.reconnect_at = None;
                self.set_state(StreamState::Stopping);
                self.links.transport.raise(TransportCommand::Stop);
            }
            StreamCommand::StartStream => self.start_streaming(),
            StreamCommand::StopStream => self.stop_streaming(),
            StreamCommand::SendReport => {
                if self.state != StreamState::Disconnected {
                    if let Some(info) = self.links.report.peek() {
                        match OutgoingMessage::client_info(info) {
                            Ok(msg) => self.send(msg),
                            Err(e) => tracing::warn!("Failed to encode client info: {}", e),
                        }
                    }
                }
            }
            StreamCommand::TransportEvent => {}
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.state == StreamState::Stopping && event != TransportEvent::TaskClosing {
            return;
        }
        match event {
            TransportEvent::Established if self.state != StreamState::Connecting => {
                // A disconnect was requested while the connection was opening
                tracing::debug!("Ignoring connection established in state {}", self.state);
            }
            TransportEvent::Failed(_) | TransportEvent::Dropped(_)
                if self.state == StreamState::Disconnected =>
            {
                tracing::debug!("Ignoring transport failure while disconnected");
            }
            TransportEvent::Established => {
                // Nothing from a previous connection stays valid
                self.links.rx_buffer.reset();
                self.links.playout.reset();
                self.time_stats.reset();
                self.framing_errors = 0;
                self.last_time_sync = None;
                self.codec_header_sent = false;
                self.send_hello();
                self.set_state(StreamState::ConnectedIdle);
                if self.start_after_connecting {
                    self.start_streaming();
                }
            }
            TransportEvent::Failed(reason) | TransportEvent::Dropped(reason) => {
                if self.config.reconnect_on_error {
                    if self.state == StreamState::Streaming {
                        self.start_after_connecting = true;
                    }
                    tracing::info!(
                        "Stream connection lost ({}), reconnecting in {:?}",
                        reason,
                        self.config.reconnect_backoff()
                    );
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_backoff());
                    self.set_state(StreamState::Disconnected);
                } else {
                    self.fail(reason);
                }
            }
            TransportEvent::Closed => self.set_state(StreamState::Disconnected),
            TransportEvent::TaskClosing => {
                self.set_state(StreamState::Disconnected);
                self.finished = true;
            }
        }
    }

    /// Timer duties: pending reconnects and the time-sync cadence
    pub fn poll(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if now >= at && self.state == StreamState::Disconnected {
                self.reconnect_at = None;
                self.set_state(StreamState::Connecting);
                self.links.transport.raise(TransportCommand::Connect);
            }
        }

        if self.state.is_connected() {
            let interval = if self.time_stats.is_ready() {
                self.config.time_sync_interval_ms
            } else {
                self.config.time_sync_fast_interval_ms
            };
            let due = self
                .last_time_sync
                .map_or(true, |last| now.duration_since(last) >= Duration::from_millis(interval));
            if due {
                self.time_sync_id = self.time_sync_id.wrapping_add(1);
                self.send(OutgoingMessage::time().with_id(self.time_sync_id));
                self.last_time_sync = Some(now);
            }
        }
    }

    /// Pop and classify at most one message, waiting up to `timeout`
    pub fn process_next_message(&mut self, timeout: Duration) -> Processed {
        let rx_buffer = self.links.rx_buffer.clone();
        let Some(chunk) = rx_buffer.get_next_chunk(timeout) else {
            return Processed::Nothing;
        };

        let frame = match Frame::decode(&chunk) {
            Ok(frame) => frame,
            Err(ProtocolError::Truncated { needed, available }) => {
                return self.fail_stream(format!(
                    "framing violation: needed {} bytes, {} available",
                    needed, available
                ));
            }
            Err(e) => {
                self.framing_errors += 1;
                tracing::debug!("Dropping malformed message: {}", e);
                if self.framing_errors >= self.config.max_framing_errors {
                    return self.fail_stream(format!(
                        "{} consecutive malformed messages",
                        self.framing_errors
                    ));
                }
                return Processed::Dropped(DropReason::Malformed);
            }
        };
        self.framing_errors = 0;

        match frame.message {
            Message::Time { latency } => {
                self.on_time(&frame.header, latency);
                Processed::TimeSync
            }
            Message::ServerSettings { settings, .. } => {
                self.on_server_settings(settings);
                Processed::ServerSettings
            }
            Message::CodecHeader(header) => self.on_codec_header(header),
            Message::WireChunk(chunk) => self.on_wire_chunk(chunk),
            Message::Other { msg_type, .. } => {
                tracing::trace!("Ignoring {:?} message", msg_type);
                Processed::Ignored(msg_type)
            }
        }
    }

    fn on_time(&mut self, header: &MessageHeader, c2s: Timestamp) {
        let s2c = header.received - header.sent;
        // Offsets cancel in the sum, leaving the round trip
        let rtt = c2s + s2c;
        self.time_stats.add_offset((c2s - s2c) / 2, rtt);
        tracing::trace!(
            "Time sync: c2s {}, s2c {}, estimate {}",
            c2s,
            s2c,
            self.time_stats.get_estimate()
        );
    }

    fn on_server_settings(&mut self, settings: ServerSettings) {
        tracing::debug!(
            "Server settings: buffer {}ms, latency {}ms, volume {}, muted {}",
            settings.buffer_ms,
            settings.latency,
            settings.volume,
            settings.muted
        );
        self.server_settings = Some(settings);
        self.publish(StreamStatus {
            state: self.state,
            volume: Some(settings.volume.min(100) as u8),
            muted: settings.muted,
        });
    }

    fn on_codec_header(&mut self, header: CodecHeader<'_>) -> Processed {
        if self.state != StreamState::Streaming {
            return Processed::Dropped(DropReason::NotStreaming);
        }
        if !header.payload.is_empty() {
            if let Err(e) = self
                .links
                .playout
                .write(header.payload, Timestamp::ZERO, Self::IDLE_WAIT)
            {
                tracing::warn!("Playout buffer rejected codec header: {}", e);
                return Processed::Dropped(DropReason::PlayoutFull);
            }
        }
        tracing::info!(
            "Codec header received: {} ({} bytes)",
            header.codec,
            header.payload.len()
        );
        self.codec_header_sent = true;
        Processed::CodecHeader
    }

    fn on_wire_chunk(&mut self, chunk: WireChunk<'_>) -> Processed {
        if self.state != StreamState::Streaming {
            return Processed::Dropped(DropReason::NotStreaming);
        }
        if !self.codec_header_sent {
            return Processed::Dropped(DropReason::NoCodecHeader);
        }
        if !self.time_stats.is_ready() {
            return Processed::Dropped(DropReason::ClockNotReady);
        }

        let playout_at = self.to_local_time(chunk.timestamp);
        let now = Timestamp::now();
        if playout_at < now {
            tracing::trace!("Dropping chunk {}ms late", (now - playout_at).to_millis());
            return Processed::Dropped(DropReason::TooLate);
        }
        if chunk.payload.is_empty() {
            return Processed::Ignored(MessageType::WireChunk);
        }

        match self
            .links
            .playout
            .write(chunk.payload, playout_at, Self::STREAMING_WAIT)
        {
            Ok(_) => Processed::Scheduled(playout_at),
            Err(e) => {
                tracing::debug!("Playout buffer full, dropping chunk: {}", e);
                Processed::Dropped(DropReason::PlayoutFull)
            }
        }
    }

    /// Server capture time to local playout time
    fn to_local_time(&self, server_time: Timestamp) -> Timestamp {
        let delay_ms = self
            .server_settings
            .map_or(0, |s| s.buffer_ms as i64 + s.latency as i64);
        server_time - self.time_stats.get_estimate() + Timestamp::from_millis(delay_ms)
    }

    fn start_streaming(&mut self) {
        if self.state == StreamState::Streaming {
            return;
        }
        if self.state != StreamState::ConnectedIdle {
            self.start_after_connecting = true;
            return;
        }
        self.codec_header_sent = false;
        self.send_hello();
        self.links.playout.reset();
        self.start_after_connecting = false;
        self.set_state(StreamState::Streaming);
    }

    fn stop_streaming(&mut self) {
        self.start_after_connecting = false;
        if self.state == StreamState::Streaming {
            self.set_state(StreamState::ConnectedIdle);
        }
    }

    fn fail_stream(&mut self, reason: String) -> Processed {
        tracing::warn!("Stream error: {}", reason);
        if self.config.reconnect_on_error {
            if self.state == StreamState::Streaming {
                self.start_after_connecting = true;
            }
            self.links
                .transport
                .raise_all(&[TransportCommand::Disconnect, TransportCommand::Connect]);
            self.set_state(StreamState::Connecting);
        } else {
            self.fail(reason.clone());
        }
        Processed::Failed(reason)
    }

    fn fail(&mut self, reason: String) {
        tracing::error!("Stream entering error state: {}", reason);
        self.error = Some(reason);
        self.set_state(StreamState::Error);
    }

    fn send_hello(&mut self) {
        match OutgoingMessage::hello(&self.hello) {
            Ok(msg) => self.send(msg),
            Err(e) => tracing::warn!("Failed to encode hello: {}", e),
        }
    }

    /// Queue a message for the transport without blocking
    fn enqueue(&self, msg: OutgoingMessage) -> Result<(), NetworkError> {
        self.links.outgoing.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::QueueFull,
            TrySendError::Disconnected(_) => NetworkError::NotRunning,
        })
    }

    /// Queue a message for the transport; a full queue drops it
    fn send(&mut self, msg: OutgoingMessage) {
        let kind = msg.message_type();
        match self.enqueue(msg) {
            Ok(()) => {}
            Err(NetworkError::QueueFull) => {
                self.outgoing_dropped += 1;
                tracing::debug!("Outgoing queue full, dropping {:?}", kind);
            }
            Err(e) => tracing::warn!("Cannot queue {:?}: {}", kind, e),
        }
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state == state {
            return;
        }
        tracing::info!("Stream state: {} -> {}", self.state, state);
        self.state = state;
        self.publish(StreamStatus::state_only(state));
    }

    fn publish(&self, status: StreamStatus) {
        self.links.status.post(status);
        if let Some(callback) = &self.on_status {
            callback(status);
        }
    }
}
