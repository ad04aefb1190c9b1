//! Snapcast Client Application
//!
//! Connects to a Snapcast server and plays the assigned stream into a
//! logging sink.
//!
//! Usage: `snapclient [SERVER] [CONFIG]` where `SERVER` is an IP/hostname or
//! a `snapcast://` URL.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapstream_client::{
    audio::{PlaybackSink, PlayoutPump, VolumeControl},
    client::{PlaybackDecision, SnapClient},
    config::AppConfig,
    url::SnapcastUrl,
};

/// Sink that counts what it is given instead of rendering it
#[derive(Default)]
struct LoggingSink {
    bytes: u64,
    chunks: u64,
    last_report: Option<Instant>,
}

impl PlaybackSink for LoggingSink {
    fn write(&mut self, samples: &[u8]) -> snapstream_client::Result<usize> {
        self.bytes += samples.len() as u64;
        self.chunks += 1;
        let due = self
            .last_report
            .map_or(true, |at| at.elapsed() >= Duration::from_secs(5));
        if due {
            tracing::info!("Sink: {} chunks, {} bytes played", self.chunks, self.bytes);
            self.last_report = Some(Instant::now());
        }
        Ok(samples.len())
    }

    fn has_buffered_data(&self) -> bool {
        false
    }
}

struct LoggingVolume;

impl VolumeControl for LoggingVolume {
    fn set_volume(&self, volume: f32) {
        tracing::info!("Server volume: {:.0}%", volume * 100.0);
    }

    fn set_mute(&self, muted: bool) {
        tracing::info!("Server mute: {}", muted);
    }
}

fn server_url(arg: Option<&String>, config: &AppConfig) -> Result<SnapcastUrl> {
    match arg {
        Some(arg) if SnapcastUrl::is_snapcast_url(arg) => Ok(arg.parse()?),
        Some(host) => Ok(SnapcastUrl::new(host.as_str())),
        None if !config.stream.server_ip.is_empty() => {
            Ok(SnapcastUrl::new(config.stream.server_ip.as_str()))
        }
        None => bail!("no server given: pass SERVER or set stream.server_ip in the config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Snapcast client");

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(2) {
        Some(path) => AppConfig::load(Path::new(path))
            .with_context(|| format!("loading config from {}", path))?,
        None => AppConfig::load_or_default()?,
    };
    let url = server_url(args.get(1), &config)?;
    tracing::info!("Server: {}", url);

    let mut client = SnapClient::new(config, Arc::new(LoggingVolume));
    let mut pump = PlayoutPump::start(client.playout_buffer(), LoggingSink::default())?;

    client.connect_url(&url).await?;
    client.start_playback()?;

    let decisions = client.decisions();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut last_stats = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutting down");
                break;
            }
            _ = tick.tick() => {}
        }

        while let Ok(decision) = decisions.try_recv() {
            let result = match decision {
                PlaybackDecision::Play(url) => {
                    tracing::info!("Playing {}", url);
                    client.start_playback()
                }
                PlaybackDecision::Stop { stream } => {
                    tracing::info!("Stream {} stopped playing", stream);
                    client.stop_playback()
                }
            };
            if let Err(e) = result {
                tracing::warn!("Playback change failed: {}", e);
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            let stream = client.stream();
            if let Some(stats) = stream.transport_stats() {
                tracing::info!(
                    "Stream {}: {} messages, {} bytes received, {} dropped",
                    stream.state(),
                    stats.messages_received,
                    stats.bytes_received,
                    stats.messages_dropped
                );
            }
            let pump_stats = pump.stats();
            tracing::info!(
                "Playout: {} chunks played, {} late",
                pump_stats.chunks_played,
                pump_stats.chunks_late
            );
        }
    }

    client.disconnect().await;
    pump.stop();
    Ok(())
}
