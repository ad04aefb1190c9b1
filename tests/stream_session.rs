//! End-to-end stream session against an in-process Snapcast server

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use snapstream_client::audio::TimedRead;
use snapstream_client::config::AppConfig;
use snapstream_client::protocol::{
    ClientInfo, MessageHeader, MessageType, OutgoingMessage, ServerSettings,
};
use snapstream_client::stream::{SnapcastStream, StreamState, StreamStatus};
use snapstream_client::timestamp::Timestamp;

const CHUNK_INTERVAL: Duration = Duration::from_millis(20);
const CODEC_HEADER: &[u8] = &[0xC0; 10];
const SETTINGS: ServerSettings = ServerSettings {
    buffer_ms: 100,
    latency: 0,
    volume: 55,
    muted: false,
};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Hello,
    ClientInfo(ClientInfo),
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.client.id = "integration-test".into();
    config.stream.reconnect_backoff_ms = 100;
    config.stream.time_sync_fast_interval_ms = 10;
    config.clock.min_valid_samples = 5;
    config.rpc.enabled = false;
    config
}

fn read_message(stream: &mut TcpStream) -> io::Result<(MessageHeader, Vec<u8>)> {
    let mut raw = [0u8; MessageHeader::SIZE];
    stream.read_exact(&mut raw)?;
    let header = MessageHeader::from_bytes(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload)?;
    Ok((header, payload))
}

/// Answers hello and time requests; streams a 100-byte chunk every 20ms
fn serve(stream: TcpStream, stop: Arc<AtomicBool>, seen: Sender<Seen>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = stream.try_clone().unwrap();
        let mut writer = stream;
        let (replies_tx, replies) = unbounded::<OutgoingMessage>();

        let read_loop = thread::spawn(move || {
            while let Ok((header, payload)) = read_message(&mut reader) {
                match header.message_type() {
                    Some(MessageType::Hello) => {
                        let _ = seen.send(Seen::Hello);
                        let _ = replies_tx.send(OutgoingMessage::server_settings(&SETTINGS).unwrap());
                        let _ = replies_tx.send(OutgoingMessage::codec_header("pcm", CODEC_HEADER));
                    }
                    Some(MessageType::Time) => {
                        let c2s = Timestamp::now() - header.sent;
                        let reply = OutgoingMessage::new(MessageType::Time, c2s.to_le_bytes().to_vec())
                            .with_refers_to(header.id);
                        let _ = replies_tx.send(reply);
                    }
                    Some(MessageType::ClientInfo) => {
                        let info: ClientInfo = serde_json::from_slice(&payload[4..]).unwrap();
                        let _ = seen.send(Seen::ClientInfo(info));
                    }
                    _ => {}
                }
            }
        });

        let mut next_chunk = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            match replies.recv_timeout(Duration::from_millis(5)) {
                Ok(mut msg) => {
                    msg.set_send_time();
                    if writer.write_all(&msg.to_bytes()).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if Instant::now() >= next_chunk {
                next_chunk += CHUNK_INTERVAL;
                let mut chunk = OutgoingMessage::wire_chunk(Timestamp::now(), &[0x55; 100]);
                chunk.set_send_time();
                if writer.write_all(&chunk.to_bytes()).is_err() {
                    break;
                }
            }
        }
        let _ = writer.shutdown(Shutdown::Both);
        let _ = read_loop.join();
    })
}

fn wait_for_seen(seen: &Receiver<Seen>, want: impl Fn(&Seen) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match seen.recv_timeout(left) {
            Ok(item) if want(&item) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

#[test]
fn test_streams_audio_with_playout_times() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = Arc::new(AtomicBool::new(false));
    let (seen_tx, seen) = unbounded();

    let server_stop = stop.clone();
    let acceptor = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        serve(socket, server_stop, seen_tx).join().unwrap();
    });

    let statuses = Arc::new(Mutex::new(Vec::<StreamStatus>::new()));
    let sink = statuses.clone();
    let mut stream = SnapcastStream::new(&test_config());
    stream.set_on_status_update(Arc::new(move |status| sink.lock().push(status)));
    stream.connect("127.0.0.1", port).unwrap();
    stream.start().unwrap();

    assert!(stream.wait_for_state(StreamState::Streaming, Duration::from_secs(5)));
    assert!(wait_for_seen(&seen, |s| *s == Seen::Hello));

    let playout = stream.playout_buffer();
    let mut buf = vec![0u8; 4096];
    let mut saw_header = false;
    let mut scheduled = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduled.is_none() && Instant::now() < deadline {
        match playout.read(&mut buf, Duration::from_millis(100)) {
            TimedRead::Chunk { len, stamp } if stamp.is_zero() => {
                assert_eq!(&buf[..len], CODEC_HEADER);
                saw_header = true;
            }
            TimedRead::Chunk { len, stamp } => {
                assert_eq!(len, 100);
                scheduled = Some(stamp);
            }
            TimedRead::TooSmall { needed } => panic!("chunk of {} bytes", needed),
            TimedRead::Empty => {}
        }
    }
    assert!(saw_header, "codec header must precede audio");
    let stamp = scheduled.expect("no audio chunk was scheduled");
    let ahead = (stamp - Timestamp::now()).to_millis();
    assert!((-50..=150).contains(&ahead), "chunk scheduled {}ms ahead", ahead);

    assert!(stream.report_volume(30, true));
    assert!(wait_for_seen(&seen, |s| {
        *s == Seen::ClientInfo(ClientInfo {
            volume: 30,
            muted: true,
        })
    }));

    assert!(statuses
        .lock()
        .iter()
        .any(|s| s.volume == Some(55) && !s.muted));

    stream.disconnect();
    assert!(!stream.is_running());
    stop.store(true, Ordering::SeqCst);
    acceptor.join().unwrap();
}

#[test]
fn test_reconnects_after_server_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = Arc::new(AtomicBool::new(false));
    let (seen_tx, seen) = unbounded();

    let server_stop = stop.clone();
    let acceptor = thread::spawn(move || {
        // First connection: wait for the hello, then hang up
        let (mut first, _) = listener.accept().unwrap();
        while let Ok((header, _)) = read_message(&mut first) {
            if header.message_type() == Some(MessageType::Hello) {
                break;
            }
        }
        first.shutdown(Shutdown::Both).unwrap();

        let (second, _) = listener.accept().unwrap();
        serve(second, server_stop, seen_tx).join().unwrap();
    });

    let mut stream = SnapcastStream::new(&test_config());
    stream.connect("127.0.0.1", port).unwrap();
    stream.start().unwrap();

    assert!(stream.wait_for_state(StreamState::Disconnected, Duration::from_secs(5)));
    assert!(wait_for_seen(&seen, |s| *s == Seen::Hello));
    assert!(stream.wait_for_state(StreamState::Streaming, Duration::from_secs(5)));

    let playout = stream.playout_buffer();
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got_audio = false;
    while !got_audio && Instant::now() < deadline {
        if let TimedRead::Chunk { stamp, .. } = playout.read(&mut buf, Duration::from_millis(100)) {
            got_audio = !stamp.is_zero();
        }
    }
    assert!(got_audio, "audio must resume after reconnecting");

    stream.disconnect();
    stop.store(true, Ordering::SeqCst);
    acceptor.join().unwrap();
}

#[test]
fn test_close_stays_closed_until_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = Arc::new(AtomicBool::new(false));
    let (seen_tx, seen) = unbounded();

    let server_stop = stop.clone();
    let acceptor = thread::spawn(move || {
        let (first, _) = listener.accept().unwrap();
        let first = serve(first, server_stop.clone(), seen_tx.clone());
        let (second, _) = listener.accept().unwrap();
        serve(second, server_stop, seen_tx).join().unwrap();
        first.join().unwrap();
    });

    let mut stream = SnapcastStream::new(&test_config());
    stream.connect("127.0.0.1", port).unwrap();
    stream.start().unwrap();
    assert!(stream.wait_for_state(StreamState::Streaming, Duration::from_secs(5)));
    assert!(wait_for_seen(&seen, |s| *s == Seen::Hello));

    stream.close().unwrap();
    assert!(stream.wait_for_state(StreamState::Disconnected, Duration::from_secs(5)));
    // Several reconnect backoffs pass without a new connection
    thread::sleep(Duration::from_millis(500));
    assert_eq!(stream.state(), StreamState::Disconnected);
    assert!(stream.is_running());

    stream.reconnect().unwrap();
    assert!(stream.wait_for_state(StreamState::ConnectedIdle, Duration::from_secs(5)));
    assert!(wait_for_seen(&seen, |s| *s == Seen::Hello));

    stream.disconnect();
    stop.store(true, Ordering::SeqCst);
    acceptor.join().unwrap();
}

#[test]
fn test_refused_connection_without_reconnect_is_an_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = test_config();
    config.stream.reconnect_on_error = false;
    let mut stream = SnapcastStream::new(&config);
    stream.connect("127.0.0.1", port).unwrap();

    assert!(stream.wait_for_state(StreamState::Error, Duration::from_secs(5)));
    assert!(!stream.is_connected());
    stream.disconnect();
}
