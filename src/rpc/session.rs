//! Line-delimited JSON-RPC control session
//!
//! The session keeps track of which stream this client's group plays and
//! reports that stream's playback status through a callback. Protocol
//! handling lives in [`ControlSession::handle_line`] and is independent of
//! the socket; [`ControlHandle::spawn`] drives it over TCP on the tokio
//! runtime and reconnects with a fixed backoff until cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{NetworkError, Result};
use crate::rpc::model::{ClientState, ServerStatus, StreamInfo, StreamProperties};

/// Ids used for requests this client issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestId {
    GetServerStatus = 1,
}

/// Called with the assigned stream whenever its status may have changed
pub type StreamUpdateCallback = Arc<dyn Fn(&StreamInfo) + Send + Sync>;

#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<u32>,
    method: Option<String>,
    result: Option<Value>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ServerParams {
    server: ServerStatus,
}

#[derive(Debug, Deserialize)]
struct StreamUpdateParams {
    id: String,
    stream: StreamInfo,
}

#[derive(Debug, Deserialize)]
struct StreamPropertiesParams {
    id: String,
    #[serde(default)]
    properties: StreamProperties,
}

#[derive(Debug, Deserialize)]
struct GroupStreamParams {
    id: String,
    stream_id: String,
}

#[derive(Debug, Deserialize)]
struct ClientParams {
    id: String,
}

/// Encode one JSON-RPC request line
pub fn request_line(method: &str, params: Value, id: RequestId) -> String {
    let mut line = json!({
        "jsonrpc": "2.0",
        "id": id as u32,
        "method": method,
        "params": params,
    })
    .to_string();
    line.push('\n');
    line
}

fn status_request() -> String {
    request_line("Server.GetStatus", json!({}), RequestId::GetServerStatus)
}

/// Protocol state of the control connection
pub struct ControlSession {
    client_id: String,
    state: ClientState,
    known_streams: HashMap<String, StreamInfo>,
    on_stream_update: Option<StreamUpdateCallback>,
}

impl ControlSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: ClientState::default(),
            known_streams: HashMap::new(),
            on_stream_update: None,
        }
    }

    pub fn set_on_stream_update(&mut self, callback: StreamUpdateCallback) {
        self.on_stream_update = Some(callback);
    }

    pub fn client_state(&self) -> &ClientState {
        &self.state
    }

    pub fn known_streams(&self) -> &HashMap<String, StreamInfo> {
        &self.known_streams
    }

    /// The line to send right after connecting
    pub fn greeting(&self) -> String {
        status_request()
    }

    /// Process one received line; returns a request to send back, if any
    pub fn handle_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let incoming: Incoming = match serde_json::from_str(line) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::debug!("Skipping malformed control line: {}", e);
                return None;
            }
        };

        if let (Some(id), Some(result)) = (incoming.id, incoming.result) {
            self.on_result(id, result);
            return None;
        }
        let method = incoming.method?;
        match self.on_notification(&method, incoming.params) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Skipping malformed {} notification: {}", method, e);
                None
            }
        }
    }

    fn on_result(&mut self, id: u32, result: Value) {
        if id != RequestId::GetServerStatus as u32 {
            tracing::warn!("Unknown request id: {}", id);
            return;
        }
        match serde_json::from_value::<ServerParams>(result) {
            Ok(params) => self.update_from_server(params.server),
            Err(e) => tracing::debug!("Malformed server status: {}", e),
        }
    }

    fn on_notification(
        &mut self,
        method: &str,
        params: Value,
    ) -> serde_json::Result<Option<String>> {
        match method {
            "Server.OnUpdate" => {
                let params: ServerParams = serde_json::from_value(params)?;
                self.update_from_server(params.server);
            }
            "Stream.OnUpdate" => {
                let params: StreamUpdateParams = serde_json::from_value(params)?;
                let is_assigned = params.id == self.state.stream_id;
                self.known_streams.insert(params.id, params.stream.clone());
                if is_assigned {
                    self.notify(&params.stream);
                }
            }
            "Stream.OnProperties" => {
                let params: StreamPropertiesParams = serde_json::from_value(params)?;
                if params.id == self.state.stream_id {
                    let info = self
                        .known_streams
                        .entry(params.id.clone())
                        .or_insert_with(|| StreamInfo::idle(&params.id));
                    info.apply_properties(params.properties);
                    let info = info.clone();
                    self.notify(&info);
                }
            }
            "Group.OnStreamChanged" => {
                let params: GroupStreamParams = serde_json::from_value(params)?;
                if params.id == self.state.group_id && params.stream_id != self.state.stream_id {
                    tracing::info!("Group {} switched to stream {}", params.id, params.stream_id);
                    let info = self
                        .known_streams
                        .entry(params.stream_id.clone())
                        .or_insert_with(|| StreamInfo::idle(&params.stream_id))
                        .clone();
                    self.state.stream_id = params.stream_id;
                    self.notify(&info);
                }
            }
            "Client.OnConnect" => {
                let params: ClientParams = serde_json::from_value(params)?;
                if params.id == self.client_id {
                    return Ok(Some(status_request()));
                }
            }
            other => tracing::trace!("Ignoring notification {}", other),
        }
        Ok(None)
    }

    fn update_from_server(&mut self, server: ServerStatus) {
        match ClientState::from_groups(&server.groups, &self.client_id) {
            Some(state) => {
                tracing::debug!(
                    "Client is in group {} playing stream {}",
                    state.group_id,
                    state.stream_id
                );
                self.state = state;
            }
            None => tracing::debug!("Client {} not found in any group", self.client_id),
        }

        self.known_streams = server
            .streams
            .into_iter()
            .map(|stream| (stream.id.clone(), stream))
            .collect();
        if let Some(info) = self.known_streams.get(&self.state.stream_id).cloned() {
            self.notify(&info);
        }
    }

    fn notify(&self, info: &StreamInfo) {
        if let Some(callback) = &self.on_stream_update {
            callback(info);
        }
    }
}

/// Where the control server lives
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_backoff: Duration,
}

/// Running control session task
pub struct ControlHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ControlHandle {
    /// Spawn the session on the current tokio runtime
    pub fn spawn(session: ControlSession, config: ControlConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(session, config, cancel.clone()));
        Self { cancel, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the session and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Control session task failed: {}", e);
        }
    }
}

async fn run(mut session: ControlSession, config: ControlConfig, cancel: CancellationToken) {
    tracing::debug!("Control session started for {}:{}", config.host, config.port);
    loop {
        match serve(&mut session, &config, &cancel).await {
            Ok(()) => break,
            Err(e) => tracing::warn!(
                "Control connection to {}:{} lost: {}; retrying in {:?}",
                config.host,
                config.port,
                e,
                config.reconnect_backoff
            ),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_backoff) => {}
        }
    }
    tracing::debug!("Control session stopped");
}

/// One connection; `Ok` only when cancelled
async fn serve(
    session: &mut ControlSession,
    config: &ControlConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        stream = TcpStream::connect((config.host.as_str(), config.port)) => stream?,
    };
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    tracing::info!("Control session connected to {}:{}", config.host, config.port);

    let (reader, mut writer) = stream.into_split();
    writer.write_all(session.greeting().as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Err(NetworkError::Dropped("closed by server".into()).into());
        };
        if let Some(request) = session.handle_line(&line) {
            writer.write_all(request.as_bytes()).await?;
        }
    }
}
