//! Client facade tying the audio stream to the control session
//!
//! Server volume and mute changes arriving on the stream go to the
//! [`VolumeControl`] collaborator. Playback status of the assigned stream,
//! reported by the control session, becomes [`PlaybackDecision`]s the
//! application applies through [`SnapClient::start_playback`] and
//! [`SnapClient::stop_playback`].

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::sink::VolumeControl;
use crate::audio::timed::SharedTimedBuffer;
use crate::config::AppConfig;
use crate::error::Result;
use crate::rpc::{ControlConfig, ControlHandle, ControlSession, StreamInfo};
use crate::stream::{SnapcastStream, StreamState, StreamStatus};
use crate::url::SnapcastUrl;

/// What the application should do with playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackDecision {
    /// The assigned stream started playing
    Play(SnapcastUrl),
    /// The assigned stream left the playing state
    Stop { stream: String },
}

/// Detects the edges of the assigned stream's `playing` status
#[derive(Debug)]
pub struct PlaybackTracker {
    url: SnapcastUrl,
    last_status: String,
}

impl PlaybackTracker {
    pub fn new(url: SnapcastUrl) -> Self {
        Self {
            url,
            last_status: "unknown".to_string(),
        }
    }

    pub fn url(&self) -> &SnapcastUrl {
        &self.url
    }

    pub fn on_stream_update(&mut self, info: &StreamInfo) -> Option<PlaybackDecision> {
        tracing::info!("Stream {} status: {}", info.id, info.status);
        let was_playing = self.last_status == "playing";
        if info.is_playing() && !was_playing {
            self.url.stream_name = Some(info.id.clone());
            self.last_status = info.status.clone();
            Some(PlaybackDecision::Play(self.url.clone()))
        } else if !info.is_playing() && was_playing {
            self.last_status = info.status.clone();
            Some(PlaybackDecision::Stop {
                stream: info.id.clone(),
            })
        } else {
            None
        }
    }
}

/// Convert a 0..1 volume to the percent reported to the server
pub fn volume_percent(volume: f32) -> u8 {
    (volume * 100.0 + 0.5).clamp(0.0, 100.0) as u8
}

/// Forward a stream status to the volume collaborator
fn apply_status(status: StreamStatus, volume: &dyn VolumeControl) {
    match status.state {
        StreamState::Error | StreamState::Disconnected => {
            tracing::debug!("Stream {}", status.state);
        }
        _ => {
            if let Some(percent) = status.volume.filter(|v| *v <= 100) {
                volume.set_volume(percent as f32 / 100.0);
                volume.set_mute(status.muted);
            }
        }
    }
}

pub struct SnapClient {
    config: AppConfig,
    stream: SnapcastStream,
    control: Option<ControlHandle>,
    tracker: Arc<Mutex<PlaybackTracker>>,
    decisions_tx: Sender<PlaybackDecision>,
    decisions_rx: Receiver<PlaybackDecision>,
}

impl SnapClient {
    pub fn new(config: AppConfig, volume: Arc<dyn VolumeControl>) -> Self {
        let mut stream = SnapcastStream::new(&config);
        stream.set_on_status_update(Arc::new(move |status| apply_status(status, volume.as_ref())));
        let (decisions_tx, decisions_rx) = unbounded();
        Self {
            tracker: Arc::new(Mutex::new(PlaybackTracker::new(SnapcastUrl::new(
                config.stream.server_ip.clone(),
            )))),
            config,
            stream,
            control: None,
            decisions_tx,
            decisions_rx,
        }
    }

    pub fn stream(&self) -> &SnapcastStream {
        &self.stream
    }

    pub fn playout_buffer(&self) -> SharedTimedBuffer {
        self.stream.playout_buffer()
    }

    /// Playback decisions derived from control session updates
    pub fn decisions(&self) -> Receiver<PlaybackDecision> {
        self.decisions_rx.clone()
    }

    /// URL of the server, including the last stream that played
    pub fn current_url(&self) -> SnapcastUrl {
        self.tracker.lock().url().clone()
    }

    /// Connect the audio stream and, when enabled, the control session.
    /// Must be called from within a tokio runtime.
    pub async fn connect(&mut self, host: &str, stream_port: u16, rpc_port: u16) -> Result<()> {
        self.disconnect().await;

        *self.tracker.lock() = PlaybackTracker::new(SnapcastUrl {
            host: host.to_string(),
            stream_port: Some(stream_port),
            stream_name: None,
            rpc_port: Some(rpc_port),
        });
        self.stream.connect(host, stream_port)?;

        if self.config.rpc.enabled {
            let mut session = ControlSession::new(self.config.client.id.clone());
            let tracker = self.tracker.clone();
            let decisions = self.decisions_tx.clone();
            session.set_on_stream_update(Arc::new(move |info| {
                if let Some(decision) = tracker.lock().on_stream_update(info) {
                    let _ = decisions.send(decision);
                }
            }));
            self.control = Some(ControlHandle::spawn(
                session,
                ControlConfig {
                    host: host.to_string(),
                    port: rpc_port,
                    reconnect_backoff: std::time::Duration::from_millis(
                        self.config.rpc.reconnect_backoff_ms,
                    ),
                },
            ));
        }
        Ok(())
    }

    /// Connect using a `snapcast://` URL; missing ports fall back to config
    pub async fn connect_url(&mut self, url: &SnapcastUrl) -> Result<()> {
        let stream_port = url.stream_port.unwrap_or(self.config.stream.stream_port);
        let rpc_port = url.rpc_port.unwrap_or(self.config.stream.rpc_port);
        self.connect(&url.host, stream_port, rpc_port).await
    }

    pub async fn disconnect(&mut self) {
        if let Some(control) = self.control.take() {
            control.stop().await;
        }
        self.stream.disconnect();
    }

    pub fn start_playback(&self) -> Result<()> {
        self.stream.start()
    }

    pub fn stop_playback(&self) -> Result<()> {
        self.stream.stop_streaming()
    }

    /// Report a 0..1 volume to the server while connected
    pub fn report_volume(&self, volume: f32, muted: bool) -> bool {
        if !self.stream.is_connected() {
            return false;
        }
        self.stream.report_volume(volume_percent(volume), muted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingVolume {
        volume_bits: AtomicU32,
        muted: AtomicBool,
        calls: AtomicU32,
    }

    impl VolumeControl for RecordingVolume {
        fn set_volume(&self, volume: f32) {
            self.volume_bits.store(volume.to_bits(), Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn set_mute(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }
    }

    fn stream(id: &str, status: &str) -> StreamInfo {
        StreamInfo {
            status: status.to_string(),
            ..StreamInfo::idle(id)
        }
    }

    #[test]
    fn test_volume_percent() {
        assert_eq!(volume_percent(0.0), 0);
        assert_eq!(volume_percent(0.333), 33);
        assert_eq!(volume_percent(0.995), 100);
        assert_eq!(volume_percent(1.5), 100);
        assert_eq!(volume_percent(-1.0), 0);
    }

    #[test]
    fn test_playing_edges() {
        let mut tracker = PlaybackTracker::new(SnapcastUrl::new("10.0.0.2"));
        assert_eq!(tracker.on_stream_update(&stream("music", "idle")), None);

        match tracker.on_stream_update(&stream("music", "playing")) {
            Some(PlaybackDecision::Play(url)) => {
                assert_eq!(url.to_string(), "snapcast://10.0.0.2/music");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert_eq!(tracker.on_stream_update(&stream("music", "playing")), None);
        assert_eq!(
            tracker.on_stream_update(&stream("music", "idle")),
            Some(PlaybackDecision::Stop {
                stream: "music".into()
            })
        );
        assert_eq!(tracker.on_stream_update(&stream("music", "idle")), None);
    }

    #[test]
    fn test_status_drives_volume() {
        let volume = RecordingVolume::default();
        apply_status(
            StreamStatus {
                state: StreamState::Streaming,
                volume: Some(40),
                muted: true,
            },
            &volume,
        );
        assert_eq!(f32::from_bits(volume.volume_bits.load(Ordering::SeqCst)), 0.4);
        assert!(volume.muted.load(Ordering::SeqCst));

        apply_status(StreamStatus::state_only(StreamState::ConnectedIdle), &volume);
        apply_status(
            StreamStatus {
                state: StreamState::Disconnected,
                volume: Some(10),
                muted: false,
            },
            &volume,
        );
        assert_eq!(volume.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_requires_connection() {
        let client = SnapClient::new(AppConfig::default(), Arc::new(RecordingVolume::default()));
        assert!(!client.report_volume(0.5, false));
        assert!(client.start_playback().is_err());
        assert_eq!(client.current_url().host, "");
    }
}
