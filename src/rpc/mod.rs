//! Snapcast JSON-RPC control channel

pub mod model;
pub mod session;

pub use model::{ClientState, ServerStatus, StreamInfo, StreamProperties};
pub use session::{ControlConfig, ControlHandle, ControlSession, StreamUpdateCallback};
