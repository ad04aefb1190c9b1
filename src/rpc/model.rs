//! Cached view of the server's JSON-RPC state

use serde::Deserialize;

/// Playback status a stream reports when nothing better is known
pub const IDLE_STATUS: &str = "idle";

/// `result.server` of `Server.GetStatus`, also carried by `Server.OnUpdate`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerStatus {
    pub groups: Vec<Group>,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: String,
    pub stream_id: String,
    pub clients: Vec<GroupClient>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupClient {
    pub id: String,
    pub config: GroupClientConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupClientConfig {
    pub latency: i32,
    pub volume: Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub percent: u8,
    pub muted: bool,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            percent: 100,
            muted: false,
        }
    }
}

/// Where this client sits in the server's group layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub group_id: String,
    pub stream_id: String,
    pub latency: i32,
    pub volume_percent: u8,
    pub muted: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            stream_id: String::new(),
            latency: 0,
            volume_percent: 100,
            muted: false,
        }
    }
}

impl ClientState {
    /// Locate `client_id` among the groups
    pub fn from_groups(groups: &[Group], client_id: &str) -> Option<Self> {
        groups.iter().find_map(|group| {
            group
                .clients
                .iter()
                .find(|client| client.id == client_id)
                .map(|client| Self {
                    group_id: group.id.clone(),
                    stream_id: group.stream_id.clone(),
                    latency: client.config.latency,
                    volume_percent: client.config.volume.percent,
                    muted: client.config.volume.muted,
                })
        })
    }
}

/// Control capabilities and playback state of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamProperties {
    pub playback_status: Option<String>,
    pub can_play: bool,
    pub can_pause: bool,
    pub can_seek: bool,
    pub can_go_next: bool,
    pub can_go_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    #[serde(default = "idle_status")]
    pub status: String,
    #[serde(default)]
    pub properties: StreamProperties,
}

fn idle_status() -> String {
    IDLE_STATUS.to_string()
}

impl StreamInfo {
    /// Placeholder for a stream the server has not described yet
    pub fn idle(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: idle_status(),
            properties: StreamProperties::default(),
        }
    }

    /// Merge a `Stream.OnProperties` update
    pub fn apply_properties(&mut self, properties: StreamProperties) {
        if let Some(status) = &properties.playback_status {
            self.status = status.clone();
        }
        self.properties = properties;
    }

    pub fn is_playing(&self) -> bool {
        self.status == "playing"
    }
}
