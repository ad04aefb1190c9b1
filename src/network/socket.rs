//! TCP connection setup

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};

use crate::error::NetworkError;

/// Keep-alive probing: idle time, probe interval, probe count
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
const KEEPALIVE_RETRIES: u32 = 3;

/// Resolve `host:port` to the first usable address
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::ConnectionFailed(format!("resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| NetworkError::ConnectionFailed(format!("no address for {}", host)))
}

/// Open a stream connection with no-delay and keep-alive enabled.
///
/// Reads on the returned stream block for at most `read_timeout` so the
/// owning loop can observe commands between reads.
pub fn connect(
    addr: SocketAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!("Failed to enable TCP keep-alive: {}", e);
    }

    socket.connect_timeout(&SockAddr::from(addr), connect_timeout)?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket.set_write_timeout(Some(connect_timeout))?;

    Ok(socket.into())
}

/// Whether a read error only means "no data within the timeout"
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
