#![forbid(unsafe_code)]

pub mod backoff;
pub mod breaker;
pub mod queue;
pub mod tasks;

pub mod endpoint {
	/// Pusher protocol revision spoken by the Kick web client.
	pub const PUSHER_PROTOCOL: u8 = 7;
	/// Client library identity advertised on connect.
	pub const PUSHER_CLIENT: &str = "js";
	pub const PUSHER_CLIENT_VERSION: &str = "8.4.0-rc2";

	/// Pusher app coordinates (`cluster` + `app_key`).
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct PusherEndpoint {
		pub cluster: String,
		pub app_key: String,
	}

	impl PusherEndpoint {
		/// Validate and build an endpoint from its parts.
		pub fn new(cluster: &str, app_key: &str) -> Result<Self, String> {
			let cluster = cluster.trim();
			let app_key = app_key.trim();

			if cluster.is_empty() {
				return Err("pusher cluster must be non-empty (e.g. us2)".to_string());
			}
			if !cluster.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
				return Err(format!("invalid pusher cluster (expected [a-z0-9-]+): {cluster}"));
			}
			if app_key.is_empty() {
				return Err("pusher app key must be non-empty".to_string());
			}
			if !app_key.chars().all(|c| c.is_ascii_alphanumeric()) {
				return Err(format!("invalid pusher app key (expected alphanumeric): {app_key}"));
			}

			Ok(Self {
				cluster: cluster.to_string(),
				app_key: app_key.to_string(),
			})
		}

		/// `wss://ws-{cluster}.pusher.com/app/{app_key}?protocol=7&client=js&version=...`
		pub fn ws_url(&self) -> String {
			format!(
				"wss://ws-{}.pusher.com/app/{}?protocol={}&client={}&version={}",
				self.cluster, self.app_key, PUSHER_PROTOCOL, PUSHER_CLIENT, PUSHER_CLIENT_VERSION
			)
		}
	}

	/// Validate a full websocket URL override (`ws://` or `wss://`).
	pub fn validate_ws_url(s: &str) -> Result<(), String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("websocket url must be non-empty".to_string());
		}
		let rest = s
			.strip_prefix("wss://")
			.or_else(|| s.strip_prefix("ws://"))
			.ok_or_else(|| format!("invalid websocket url (expected ws:// or wss://): {s}"))?;

		let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
		if host.is_empty() {
			return Err(format!("invalid websocket url (missing host): {s}"));
		}
		Ok(())
	}

}
