#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use kickwatch_domain::{Channel, ChannelName};
use kickwatch_util::breaker::{CircuitBreaker, CircuitBreakerConfig};
use kickwatch_util::tasks::{CancelReport, TaskSupervisor};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::classifier::MessageClassifier;
use super::resolver::ChannelResolver;
use super::supervisor::{
	ActiveConnections, ConnectionSupervisor, SupervisorConfig, SupervisorExit, WsConnector, default_ws_connector,
};
use crate::dispatch::NotificationSink;
use crate::session::SessionPool;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
	/// Watched username; mentions of and replies to this user are relayed.
	pub target_username: String,
	/// Channel slugs in the order they should be started.
	pub channels: Vec<ChannelName>,
	pub supervisor: SupervisorConfig,
	pub breaker: CircuitBreakerConfig,
	pub heartbeat_interval: Duration,
}

/// Runs one supervised socket per channel and routes their notifications into one sink.
pub struct KickMonitor {
	cfg: MonitorConfig,
	resolver: ChannelResolver,
	pool: Arc<SessionPool>,
	sink: Arc<dyn NotificationSink>,
	tasks: TaskSupervisor,
	connector: WsConnector,
	ws_breaker: Arc<CircuitBreaker>,
	classifier: Arc<MessageClassifier>,
	channels: Mutex<Vec<Channel>>,
	active: Arc<Mutex<Vec<Arc<ActiveConnections>>>>,
}

impl KickMonitor {
	pub fn new(
		cfg: MonitorConfig,
		resolver: ChannelResolver,
		pool: Arc<SessionPool>,
		sink: Arc<dyn NotificationSink>,
		tasks: TaskSupervisor,
	) -> Self {
		let ws_breaker = Arc::new(CircuitBreaker::new("pusher", cfg.breaker));
		let classifier = Arc::new(MessageClassifier::new(&cfg.target_username));
		Self {
			cfg,
			resolver,
			pool,
			sink,
			tasks,
			connector: default_ws_connector(),
			ws_breaker,
			classifier,
			channels: Mutex::new(Vec::new()),
			active: Arc::new(Mutex::new(Vec::new())),
		}
	}

	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = connector;
		self
	}

	/// Resolve every configured channel and start its supervisor.
	///
	/// Fails only when no channel at all could be resolved.
	pub async fn start(&self) -> anyhow::Result<Vec<Channel>> {
		if self.classifier.target().is_empty() {
			warn!("no target username configured; no notifications will be produced");
		}

		let resolved = self.resolver.resolve_all(&self.cfg.channels).await;
		if resolved.is_empty() {
			return Err(anyhow!(
				"none of the {} configured channel(s) could be resolved",
				self.cfg.channels.len()
			));
		}

		for channel in &resolved {
			let sup = ConnectionSupervisor::new(
				channel.clone(),
				self.cfg.supervisor.clone(),
				Arc::clone(&self.connector),
				Arc::clone(&self.ws_breaker),
				Arc::clone(&self.classifier),
				Arc::clone(&self.sink),
				self.tasks.token(),
			);
			self.active.lock().push(sup.active_connections());

			let name = channel.name.to_string();
			self.tasks.spawn(format!("channel:{name}"), async move {
				match sup.run().await {
					SupervisorExit::Cancelled => debug!(channel = %name, "channel supervisor cancelled"),
					SupervisorExit::Exhausted { attempts } => {
						error!(channel = %name, attempts, "channel monitoring stopped after repeated failures");
					}
				}
			});
		}

		*self.channels.lock() = resolved.clone();
		self.spawn_heartbeat(resolved.len());
		info!(
			channels = resolved.len(),
			configured = self.cfg.channels.len(),
			target = %self.classifier.target(),
			"kick monitor started"
		);
		Ok(resolved)
	}

	fn spawn_heartbeat(&self, channels: usize) {
		let every = self.cfg.heartbeat_interval;
		if every.is_zero() {
			return;
		}
		let tasks = self.tasks.clone();
		let token = self.tasks.token();
		let active = Arc::clone(&self.active);
		self.tasks.spawn("heartbeat", async move {
			let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = tick.tick() => {
						let connections: usize = active.lock().iter().map(|a| a.len()).sum();
						info!(channels, connections, active_tasks = tasks.active_count(), "heartbeat");
					}
				}
			}
		});
	}

	pub fn channels(&self) -> Vec<Channel> {
		self.channels.lock().clone()
	}

	/// Open sockets across all channels.
	pub fn active_connections(&self) -> usize {
		self.active.lock().iter().map(|a| a.len()).sum()
	}

	pub fn ws_breaker(&self) -> &CircuitBreaker {
		&self.ws_breaker
	}

	/// Cancel every supervised task, wait for them under `deadline`, then release the HTTP client.
	pub async fn shutdown(&self, deadline: Duration) -> CancelReport {
		info!(active_tasks = self.tasks.active_count(), ?deadline, "kick monitor shutting down");
		let report = self.tasks.cancel_all(deadline).await;
		self.pool.cleanup().await;
		info!(finished = report.finished, aborted = report.aborted, "kick monitor stopped");
		report
	}
}
