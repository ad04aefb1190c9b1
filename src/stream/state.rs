//! Stream session state

use std::fmt;
use std::sync::Arc;

/// Lifecycle of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    #[default]
    Disconnected,
    Connecting,
    /// Connected but not forwarding audio
    ConnectedIdle,
    /// Forwarding audio to the playout buffer
    Streaming,
    /// Entered only when reconnecting is disabled; cleared by a restart
    Error,
    /// Shutdown requested
    Stopping,
}

impl StreamState {
    pub fn is_connected(self) -> bool {
        matches!(self, StreamState::ConnectedIdle | StreamState::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::ConnectedIdle => "connected-idle",
            StreamState::Streaming => "streaming",
            StreamState::Error => "error",
            StreamState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every state or server-volume change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: StreamState,
    /// Server-requested volume in percent; `None` on state-only updates
    pub volume: Option<u8>,
    pub muted: bool,
}

impl StreamStatus {
    pub fn state_only(state: StreamState) -> Self {
        Self {
            state,
            volume: None,
            muted: false,
        }
    }
}

/// Callback invoked from the controller thread on every status change
pub type StatusCallback = Arc<dyn Fn(StreamStatus) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        assert!(StreamState::ConnectedIdle.is_connected());
        assert!(StreamState::Streaming.is_connected());
        assert!(!StreamState::Connecting.is_connected());
        assert!(!StreamState::Error.is_connected());
        assert_eq!(StreamState::default(), StreamState::Disconnected);
        assert_eq!(StreamState::Streaming.to_string(), "streaming");
    }
}
