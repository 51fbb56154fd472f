#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use kickwatch_domain::ChatroomId;
use kickwatch_platform::SecretString;
use kickwatch_platform::kick::{DEFAULT_API_BASE_URL, DEFAULT_PUSHER_APP_KEY, DEFAULT_PUSHER_CLUSTER};
use kickwatch_platform::session::DEFAULT_USER_AGENT;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.kickwatch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".kickwatch").join("config.toml"))
}

/// Load the config from TOML at `path` (missing file means defaults) plus env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.normalize();

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub kick: KickSettings,
	pub breaker: BreakerSettings,
	pub dispatch: DispatchSettings,
	pub discord: DiscordSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub shutdown_timeout: Duration,
	/// Zero disables the heartbeat log.
	pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct KickSettings {
	/// Watched username.
	pub username: String,
	/// Channel slugs, in start order.
	pub channels: Vec<String>,
	/// Used when the API lookup fails: channel slug -> chatroom id.
	pub fallback_chatroom_ids: BTreeMap<String, ChatroomId>,
	pub pusher_app_key: String,
	pub pusher_cluster: String,
	/// Full websocket URL override; takes precedence over app key + cluster.
	pub pusher_ws_url: Option<String>,
	pub api_base_url: String,
	pub user_agent: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// 0 retries forever.
	pub max_reconnect_attempts: u32,
	pub connect_timeout: Duration,
	pub lookup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
	pub failure_threshold: u32,
	pub recovery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
	pub queue_capacity: usize,
	pub workers: usize,
	pub notifier_timeout: Duration,
	pub persister_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DiscordSettings {
	pub webhook_url: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub supabase_url: Option<String>,
	pub supabase_anon_key: Option<SecretString>,
	/// `sqlite:`, `postgres:` or `mysql:` URL.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	kick: FileKickSettings,

	#[serde(default)]
	breaker: FileBreakerSettings,

	#[serde(default)]
	dispatch: FileDispatchSettings,

	#[serde(default)]
	discord: FileDiscordSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	shutdown_timeout_secs: Option<u64>,
	heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	username: Option<String>,
	#[serde(default)]
	channels: Vec<String>,
	#[serde(default)]
	fallback_chatroom_ids: BTreeMap<String, toml::Value>,
	pusher_app_key: Option<String>,
	pusher_cluster: Option<String>,
	pusher_ws_url: Option<String>,
	api_base_url: Option<String>,
	user_agent: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	max_reconnect_attempts: Option<u32>,
	connect_timeout_secs: Option<u64>,
	lookup_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBreakerSettings {
	failure_threshold: Option<u32>,
	recovery_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDispatchSettings {
	queue_capacity: Option<usize>,
	workers: Option<usize>,
	notifier_timeout_secs: Option<u64>,
	persister_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDiscordSettings {
	webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	supabase_url: Option<String>,
	supabase_anon_key: Option<String>,
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn clean_channels<I: IntoIterator<Item = String>>(channels: I) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for c in channels {
		let c = c.trim().to_lowercase();
		if !c.is_empty() && !out.contains(&c) {
			out.push(c);
		}
	}
	out
}

fn parse_fallback_ids(raw: BTreeMap<String, toml::Value>) -> BTreeMap<String, ChatroomId> {
	let mut out = BTreeMap::new();
	for (name, value) in raw {
		let parsed = match &value {
			toml::Value::Integer(i) => u64::try_from(*i).ok().map(ChatroomId::new),
			toml::Value::String(s) => s.parse::<ChatroomId>().ok(),
			_ => None,
		};
		match parsed {
			Some(id) => {
				out.insert(name.trim().to_lowercase(), id);
			}
			None => warn!(channel = %name, value = %value, "kick config: ignoring non-numeric fallback chatroom id"),
		}
	}
	out
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let kick = KickSettings {
			username: non_empty(file.kick.username).unwrap_or_default(),
			channels: clean_channels(file.kick.channels),
			fallback_chatroom_ids: parse_fallback_ids(file.kick.fallback_chatroom_ids),
			pusher_app_key: non_empty(file.kick.pusher_app_key).unwrap_or_else(|| DEFAULT_PUSHER_APP_KEY.to_string()),
			pusher_cluster: non_empty(file.kick.pusher_cluster).unwrap_or_else(|| DEFAULT_PUSHER_CLUSTER.to_string()),
			pusher_ws_url: non_empty(file.kick.pusher_ws_url),
			api_base_url: non_empty(file.kick.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
			user_agent: non_empty(file.kick.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
			reconnect_min_delay: Duration::from_millis(file.kick.reconnect_min_delay_ms.unwrap_or(1_000)),
			reconnect_max_delay: Duration::from_millis(file.kick.reconnect_max_delay_ms.unwrap_or(60_000)),
			max_reconnect_attempts: file.kick.max_reconnect_attempts.unwrap_or(10),
			connect_timeout: Duration::from_secs(file.kick.connect_timeout_secs.unwrap_or(30)),
			lookup_timeout: Duration::from_secs(file.kick.lookup_timeout_secs.unwrap_or(10)),
		};

		Self {
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				shutdown_timeout: Duration::from_secs(file.server.shutdown_timeout_secs.unwrap_or(10)),
				heartbeat_interval: Duration::from_secs(file.server.heartbeat_interval_secs.unwrap_or(3_600)),
			},
			kick,
			breaker: BreakerSettings {
				failure_threshold: file.breaker.failure_threshold.unwrap_or(5),
				recovery_timeout: Duration::from_secs(file.breaker.recovery_timeout_secs.unwrap_or(60)),
			},
			dispatch: DispatchSettings {
				queue_capacity: file.dispatch.queue_capacity.unwrap_or(1_000),
				workers: file.dispatch.workers.unwrap_or(4),
				notifier_timeout: Duration::from_secs(file.dispatch.notifier_timeout_secs.unwrap_or(12)),
				persister_timeout: Duration::from_secs(file.dispatch.persister_timeout_secs.unwrap_or(20)),
			},
			discord: DiscordSettings {
				webhook_url: non_empty(file.discord.webhook_url).map(SecretString::new),
			},
			persistence: PersistenceSettings {
				supabase_url: non_empty(file.persistence.supabase_url),
				supabase_anon_key: non_empty(file.persistence.supabase_anon_key).map(SecretString::new),
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}

	/// Repair combinations that would otherwise misbehave at runtime.
	fn normalize(&mut self) {
		if self.kick.reconnect_min_delay > self.kick.reconnect_max_delay {
			warn!(
				min_ms = self.kick.reconnect_min_delay.as_millis(),
				max_ms = self.kick.reconnect_max_delay.as_millis(),
				"kick config: reconnect_min_delay > reconnect_max_delay; swapping"
			);
			std::mem::swap(&mut self.kick.reconnect_min_delay, &mut self.kick.reconnect_max_delay);
		}

		if self.dispatch.workers == 0 {
			warn!("dispatch config: workers = 0; using 1");
			self.dispatch.workers = 1;
		}
		if self.dispatch.queue_capacity == 0 {
			warn!("dispatch config: queue_capacity = 0; using 1");
			self.dispatch.queue_capacity = 1;
		}
		if self.breaker.failure_threshold == 0 {
			warn!("breaker config: failure_threshold = 0; using 1");
			self.breaker.failure_threshold = 1;
		}

		if self.kick.username.is_empty() {
			warn!("kick config: no username configured; nothing will be relayed");
		}
		if self.persistence.supabase_url.is_some() != self.persistence.supabase_anon_key.is_some() {
			warn!("persistence config: supabase_url and supabase_anon_key must both be set; supabase disabled");
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// `env` is the variable lookup; the process environment in production.
fn apply_env_overrides<F>(cfg: &mut ServerConfig, env: F)
where
	F: Fn(&str) -> Option<String>,
{
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("KICKWATCH_KICK_USERNAME") {
		cfg.kick.username = v;
		info!("kick config: username overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_CHANNELS") {
		cfg.kick.channels = clean_channels(v.split(',').map(str::to_string));
		info!(channels = cfg.kick.channels.len(), "kick config: channels overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_PUSHER_APP_KEY") {
		cfg.kick.pusher_app_key = v;
		info!("kick config: pusher_app_key overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_PUSHER_CLUSTER") {
		cfg.kick.pusher_cluster = v;
		info!(cluster = %cfg.kick.pusher_cluster, "kick config: pusher_cluster overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_PUSHER_WS_URL") {
		cfg.kick.pusher_ws_url = Some(v);
		info!("kick config: pusher_ws_url overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_API_BASE_URL") {
		cfg.kick.api_base_url = v;
		info!("kick config: api_base_url overridden by env");
	}

	if let Some(v) = text("KICKWATCH_KICK_USER_AGENT") {
		cfg.kick.user_agent = v;
		info!("kick config: user_agent overridden by env");
	}

	if let Some(Ok(min_ms)) = text("KICKWATCH_KICK_RECONNECT_MIN_DELAY_MS").map(|v| v.parse::<u64>()) {
		cfg.kick.reconnect_min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "kick config: reconnect_min_delay overridden by env");
	}

	if let Some(Ok(max_ms)) = text("KICKWATCH_KICK_RECONNECT_MAX_DELAY_MS").map(|v| v.parse::<u64>()) {
		cfg.kick.reconnect_max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "kick config: reconnect_max_delay overridden by env");
	}

	if let Some(Ok(attempts)) = text("KICKWATCH_KICK_MAX_RECONNECT_ATTEMPTS").map(|v| v.parse::<u32>()) {
		cfg.kick.max_reconnect_attempts = attempts;
		info!(attempts, "kick config: max_reconnect_attempts overridden by env");
	}

	if let Some(Ok(threshold)) = text("KICKWATCH_BREAKER_FAILURE_THRESHOLD").map(|v| v.parse::<u32>()) {
		cfg.breaker.failure_threshold = threshold;
		info!(threshold, "breaker config: failure_threshold overridden by env");
	}

	if let Some(Ok(secs)) = text("KICKWATCH_BREAKER_RECOVERY_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
		cfg.breaker.recovery_timeout = Duration::from_secs(secs);
		info!(secs, "breaker config: recovery_timeout overridden by env");
	}

	if let Some(Ok(capacity)) = text("KICKWATCH_DISPATCH_QUEUE_CAPACITY").map(|v| v.parse::<usize>()) {
		cfg.dispatch.queue_capacity = capacity;
		info!(capacity, "dispatch config: queue_capacity overridden by env");
	}

	if let Some(Ok(workers)) = text("KICKWATCH_DISPATCH_WORKERS").map(|v| v.parse::<usize>()) {
		cfg.dispatch.workers = workers;
		info!(workers, "dispatch config: workers overridden by env");
	}

	if let Some(v) = text("KICKWATCH_DISCORD_WEBHOOK_URL") {
		cfg.discord.webhook_url = Some(SecretString::new(v));
		info!("discord config: webhook_url overridden by env");
	}

	if let Some(v) = text("KICKWATCH_SUPABASE_URL") {
		cfg.persistence.supabase_url = Some(v);
		info!("persistence config: supabase_url overridden by env");
	}

	if let Some(v) = text("KICKWATCH_SUPABASE_ANON_KEY") {
		cfg.persistence.supabase_anon_key = Some(SecretString::new(v));
		info!("persistence config: supabase_anon_key overridden by env");
	}

	if let Some(v) = text("KICKWATCH_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence config: database_url overridden by env");
	}

	if let Some(false) = text("KICKWATCH_PERSISTENCE_ENABLED").and_then(|v| parse_env_bool(&v)) {
		cfg.persistence = PersistenceSettings::default();
		info!("persistence config: disabled by env");
	}

	if let Some(v) = text("KICKWATCH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("KICKWATCH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(Ok(secs)) = text("KICKWATCH_SHUTDOWN_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
		cfg.server.shutdown_timeout = Duration::from_secs(secs);
		info!(secs, "server config: shutdown_timeout overridden by env");
	}

	if let Some(Ok(secs)) = text("KICKWATCH_HEARTBEAT_INTERVAL_SECS").map(|v| v.parse::<u64>()) {
		cfg.server.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "server config: heartbeat_interval overridden by env");
	}
}
