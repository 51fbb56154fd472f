#![forbid(unsafe_code)]

mod classifier;
mod client;
mod monitor;
mod protocol;
pub mod pusher;
mod resolver;
mod supervisor;

pub use classifier::{Classification, MessageClassifier};
pub use client::{DEFAULT_API_BASE_URL, KickClient};
pub use monitor::{KickMonitor, MonitorConfig};
pub use protocol::{Action, ProtocolState, ProtocolStateMachine};
pub use resolver::{ChannelResolver, ResolutionError};
pub use supervisor::{
	ActiveConnections, BoxFuture, ConnectionError, ConnectionSupervisor, KeepaliveConfig, KickWs, SupervisorConfig,
	SupervisorExit, WsConnector, default_ws_connector,
};

/// Public Pusher app key used by the Kick web client.
pub const DEFAULT_PUSHER_APP_KEY: &str = "32cbd69e4b950bf97679";
pub const DEFAULT_PUSHER_CLUSTER: &str = "us2";
