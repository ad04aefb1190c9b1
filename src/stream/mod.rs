//! Snapcast audio stream session
//!
//! [`SnapcastStream`] owns the two threads of a session: the transport,
//! which frames bytes from the socket into the chunked ring buffer, and the
//! controller, which classifies those messages and schedules audio into the
//! timed playout buffer.
//!
//! ```text
//!   socket ──► Transport ──► ChunkedRingBuffer ──► StreamController ──► TimedRingBuffer ──► sink
//!                 ▲                                     │
//!                 └──────── outgoing queue ◄────────────┘
//! ```

pub mod controller;
pub mod state;

pub use controller::{ControllerLinks, DropReason, Processed, StreamCommand, StreamController};
pub use state::{StatusCallback, StreamState, StreamStatus};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};

use crate::audio::buffer::create_shared_buffer;
use crate::audio::timed::{create_shared_timed_buffer, SharedTimedBuffer};
use crate::config::AppConfig;
use crate::error::{NetworkError, Result};
use crate::network::signal::{Mailbox, SignalSet};
use crate::network::transport::{Transport, TransportConfig, TransportStats};
use crate::protocol::{ClientInfo, Hello};

/// Threads belonging to one connected session
struct Session {
    commands: Arc<SignalSet<StreamCommand>>,
    transport: Transport,
    controller: Option<JoinHandle<()>>,
}

/// Handle to a Snapcast stream connection
pub struct SnapcastStream {
    config: AppConfig,
    playout: SharedTimedBuffer,
    status: Arc<Mailbox<StreamStatus>>,
    report: Arc<Mailbox<ClientInfo>>,
    on_status: Option<StatusCallback>,
    session: Option<Session>,
}

impl SnapcastStream {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            playout: create_shared_timed_buffer(config.buffers.playout_buffer_bytes),
            config: config.clone(),
            status: Arc::new(Mailbox::new()),
            report: Arc::new(Mailbox::new()),
            on_status: None,
            session: None,
        }
    }

    /// Buffer the playback sink reads scheduled audio from
    pub fn playout_buffer(&self) -> SharedTimedBuffer {
        self.playout.clone()
    }

    /// Register the status callback. Takes effect on the next `connect`.
    pub fn set_on_status_update(&mut self, callback: StatusCallback) {
        self.on_status = Some(callback);
    }

    /// Spawn the session threads and start connecting to `server:port`
    pub fn connect(&mut self, server: &str, port: u16) -> Result<()> {
        if self.session.is_some() {
            self.disconnect();
        }

        let rx_buffer = create_shared_buffer(self.config.buffers.stream_buffer_bytes);
        let (outgoing_tx, outgoing_rx) = bounded(self.config.buffers.outgoing_queue_len);
        let (event_tx, event_rx) = unbounded();
        let commands = Arc::new(SignalSet::new());

        let wake = commands.clone();
        let transport = Transport::spawn(
            TransportConfig {
                host: server.to_string(),
                port,
                connect_timeout: self.config.stream.connect_timeout(),
                poll: self.config.stream.socket_poll(),
            },
            rx_buffer.clone(),
            outgoing_rx,
            Box::new(move |event| {
                let _ = event_tx.send(event);
                wake.raise(StreamCommand::TransportEvent);
            }),
        )?;

        let client = &self.config.client;
        let hello = Hello::new(&client.name, &client.host_name, &client.id, client.instance);
        let mut controller = StreamController::new(
            self.config.stream.clone(),
            &self.config.clock,
            hello,
            ControllerLinks {
                rx_buffer,
                playout: self.playout.clone(),
                outgoing: outgoing_tx,
                transport: transport.commands(),
                report: self.report.clone(),
                status: self.status.clone(),
            },
        );
        if let Some(callback) = &self.on_status {
            controller.set_status_callback(callback.clone());
        }

        let controller_commands = commands.clone();
        let handle = thread::Builder::new()
            .name("snapcast-stream".into())
            .spawn(move || controller.run(controller_commands, event_rx))?;

        tracing::info!("Stream session started for {}:{}", server, port);
        commands.raise(StreamCommand::Connect);
        self.session = Some(Session {
            commands,
            transport,
            controller: Some(handle),
        });
        Ok(())
    }

    /// Close the connection and stop both session threads
    pub fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.commands.raise(StreamCommand::Stop);
        // The controller exits once the transport reports task-closing
        session.transport.stop();
        if let Some(handle) = session.controller.take() {
            if handle.join().is_err() {
                tracing::error!("Stream controller thread panicked");
            }
        }
        tracing::info!("Stream session stopped");
    }

    /// Close the server connection but keep the session for [`reconnect`](Self::reconnect)
    pub fn close(&self) -> Result<()> {
        let session = self.session()?;
        session
            .commands
            .replace(StreamCommand::Disconnect, StreamCommand::Connect);
        Ok(())
    }

    /// Reopen a connection closed with [`close`](Self::close) or lost to an error
    pub fn reconnect(&self) -> Result<()> {
        let session = self.session()?;
        session
            .commands
            .replace(StreamCommand::Connect, StreamCommand::Disconnect);
        Ok(())
    }

    /// Begin forwarding audio; remembered until the connection is ready
    pub fn start(&self) -> Result<()> {
        let session = self.session()?;
        session
            .commands
            .replace(StreamCommand::StartStream, StreamCommand::StopStream);
        Ok(())
    }

    pub fn stop_streaming(&self) -> Result<()> {
        let session = self.session()?;
        session
            .commands
            .replace(StreamCommand::StopStream, StreamCommand::StartStream);
        Ok(())
    }

    /// Report the local volume to the server. Returns `false` when the
    /// value matches the last report and nothing was queued.
    pub fn report_volume(&self, volume: u8, muted: bool) -> bool {
        let info = ClientInfo {
            volume: volume.min(100),
            muted,
        };
        if self.report.peek() == Some(info) {
            return false;
        }
        self.report.post(info);
        if let Some(session) = &self.session {
            session.commands.raise(StreamCommand::SendReport);
        }
        true
    }

    /// Most recent published status
    pub fn status(&self) -> StreamStatus {
        self.status
            .peek()
            .unwrap_or_else(|| StreamStatus::state_only(StreamState::Disconnected))
    }

    pub fn state(&self) -> StreamState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.transport.is_running())
    }

    /// Block until the session reaches `state`
    pub fn wait_for_state(&self, state: StreamState, timeout: Duration) -> bool {
        self.status
            .wait_for(timeout, |status| status.state == state)
            .is_some()
    }

    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.session.as_ref().map(|s| s.transport.stats())
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| NetworkError::NotRunning.into())
    }
}

impl Drop for SnapcastStream {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_handle() {
        let stream = SnapcastStream::new(&AppConfig::default());
        assert_eq!(stream.state(), StreamState::Disconnected);
        assert!(!stream.is_running());
        assert!(stream.start().is_err());
        assert!(stream.close().is_err());
        assert!(stream.reconnect().is_err());
        assert!(stream.transport_stats().is_none());
    }

    #[test]
    fn test_report_only_on_change() {
        let stream = SnapcastStream::new(&AppConfig::default());
        assert!(stream.report_volume(40, false));
        assert!(!stream.report_volume(40, false));
        assert!(stream.report_volume(40, true));
        assert!(stream.report_volume(120, true));
        assert!(!stream.report_volume(100, true));
    }
}
