#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use kickwatch_domain::{Channel, ChatroomId};
use kickwatch_util::backoff::Backoff;
use kickwatch_util::breaker::CircuitBreaker;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::classifier::MessageClassifier;
use super::protocol::{Action, ProtocolStateMachine};
use crate::dispatch::NotificationSink;
use crate::new_connection_id;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type KickWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<KickWs>> + Send + Sync>;

async fn connect_pusher_ws(url: Url) -> anyhow::Result<KickWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to pusher ws")?;
	Ok(ws)
}

pub fn default_ws_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(connect_pusher_ws(url)) as BoxFuture<'static, anyhow::Result<KickWs>>)
}

#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("connect timed out after {0:?}")]
	ConnectTimeout(Duration),
	#[error("connect failed: {0:#}")]
	Connect(anyhow::Error),
	#[error("socket closed: {0}")]
	Closed(String),
	#[error("socket read failed: {0}")]
	Read(#[source] tokio_tungstenite::tungstenite::Error),
	#[error("socket write failed: {0}")]
	Write(#[source] tokio_tungstenite::tungstenite::Error),
	#[error("no pong within {0:?}")]
	KeepaliveTimeout(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
	pub ping_interval: Duration,
	pub pong_timeout: Duration,
	pub close_timeout: Duration,
}

impl Default for KeepaliveConfig {
	fn default() -> Self {
		Self {
			ping_interval: Duration::from_secs(30),
			pong_timeout: Duration::from_secs(10),
			close_timeout: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub ws_url: Url,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Consecutive failed attempts before giving up on the channel; 0 retries forever.
	pub max_reconnect_attempts: u32,
	pub connect_timeout: Duration,
	pub keepalive: KeepaliveConfig,
}

impl SupervisorConfig {
	pub fn new(ws_url: Url) -> Self {
		Self {
			ws_url,
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
			max_reconnect_attempts: 10,
			connect_timeout: Duration::from_secs(30),
			keepalive: KeepaliveConfig::default(),
		}
	}
}

/// Why a supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
	Cancelled,
	/// The attempt cap was reached; the channel is no longer monitored.
	Exhausted { attempts: u32 },
}

/// Sockets currently open for one channel.
#[derive(Debug, Default)]
pub struct ActiveConnections {
	inner: Mutex<HashMap<String, ChatroomId>>,
}

impl ActiveConnections {
	fn register(&self, id: &str, chatroom: ChatroomId) {
		self.inner.lock().insert(id.to_string(), chatroom);
		metrics::gauge!("kickwatch_active_connections").increment(1.0);
	}

	fn deregister(&self, id: &str) {
		if self.inner.lock().remove(id).is_some() {
			metrics::gauge!("kickwatch_active_connections").decrement(1.0);
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Reconnect loop around one chatroom subscription.
pub struct ConnectionSupervisor {
	channel: Channel,
	cfg: SupervisorConfig,
	connector: WsConnector,
	breaker: Arc<CircuitBreaker>,
	classifier: Arc<MessageClassifier>,
	sink: Arc<dyn NotificationSink>,
	active: Arc<ActiveConnections>,
	cancel: CancellationToken,
}

impl ConnectionSupervisor {
	pub fn new(
		channel: Channel,
		cfg: SupervisorConfig,
		connector: WsConnector,
		breaker: Arc<CircuitBreaker>,
		classifier: Arc<MessageClassifier>,
		sink: Arc<dyn NotificationSink>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			channel,
			cfg,
			connector,
			breaker,
			classifier,
			sink,
			active: Arc::new(ActiveConnections::default()),
			cancel,
		}
	}

	pub fn active_connections(&self) -> Arc<ActiveConnections> {
		Arc::clone(&self.active)
	}

	/// Returns true if cancelled while sleeping.
	async fn sleep_or_cancel(&self, delay: Duration) -> bool {
		tokio::select! {
			_ = self.cancel.cancelled() => true,
			_ = sleep(delay) => false,
		}
	}

	async fn connect(&self) -> Result<KickWs, ConnectionError> {
		let timeout = self.cfg.connect_timeout;
		match tokio::time::timeout(timeout, (self.connector)(self.cfg.ws_url.clone())).await {
			Ok(Ok(ws)) => Ok(ws),
			Ok(Err(e)) => Err(ConnectionError::Connect(e)),
			Err(_) => Err(ConnectionError::ConnectTimeout(timeout)),
		}
	}

	pub async fn run(self) -> SupervisorExit {
		let name = self.channel.name.to_string();
		let mut backoff = Backoff::new(self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
		info!(channel = %name, chatroom_id = %self.channel.id, "channel supervisor started");

		loop {
			if self.cancel.is_cancelled() {
				return SupervisorExit::Cancelled;
			}

			if !self.breaker.try_acquire() {
				let delay = backoff.skip();
				debug!(channel = %name, ?delay, breaker = %self.breaker.name(), "circuit open; skipping connect");
				if self.sleep_or_cancel(delay).await {
					return SupervisorExit::Cancelled;
				}
				continue;
			}

			let conn_id = new_connection_id();
			let connected = tokio::select! {
				_ = self.cancel.cancelled() => return SupervisorExit::Cancelled,
				res = self.connect() => res,
			};

			let err = match connected {
				Ok(ws) => {
					self.active.register(&conn_id, self.channel.id);
					backoff.reset();
					self.breaker.record_success();
					info!(channel = %name, connection = %conn_id, "pusher socket connected");

					let res = self.run_session(ws).await;
					self.active.deregister(&conn_id);
					match res {
						Ok(()) => return SupervisorExit::Cancelled,
						Err(e) => e,
					}
				}
				Err(e) => e,
			};

			self.breaker.record_failure();
			metrics::counter!("kickwatch_reconnects_total").increment(1);
			let delay = backoff.fail();
			let attempt = backoff.attempts();
			warn!(channel = %name, error = %err, attempt, ?delay, "pusher connection lost");

			if self.cfg.max_reconnect_attempts > 0 && attempt >= self.cfg.max_reconnect_attempts {
				warn!(channel = %name, attempts = attempt, "max reconnect attempts reached; stopping channel");
				return SupervisorExit::Exhausted { attempts: attempt };
			}

			if self.sleep_or_cancel(delay).await {
				return SupervisorExit::Cancelled;
			}
		}
	}

	fn deliver(&self, payload: &super::pusher::ChatPayload) {
		if let Some(notification) = self.classifier.notification_for(payload, &self.channel) {
			info!(
				channel = %self.channel.name,
				sender = %notification.message.sender,
				kind = %notification.message_type(),
				"notification detected"
			);
			self.sink.submit(notification);
		}
	}

	/// Pump one socket until it fails (`Err`) or the supervisor is cancelled (`Ok`).
	async fn run_session(&self, mut ws: KickWs) -> Result<(), ConnectionError> {
		let keepalive = self.cfg.keepalive;
		let mut machine = ProtocolStateMachine::new(self.channel.clone());
		let mut ping = tokio::time::interval_at(Instant::now() + keepalive.ping_interval, keepalive.ping_interval);
		let mut pong_deadline: Option<Instant> = None;

		let result = loop {
			let deadline = pong_deadline.unwrap_or_else(|| Instant::now() + keepalive.ping_interval);

			tokio::select! {
				_ = self.cancel.cancelled() => {
					if tokio::time::timeout(keepalive.close_timeout, ws.close(None)).await.is_err() {
						debug!(channel = %self.channel.name, "close handshake timed out");
					}
					break Ok(());
				}

				_ = ping.tick() => {
					if pong_deadline.is_none() {
						if let Err(e) = ws.send(Message::Ping(Default::default())).await {
							break Err(ConnectionError::Write(e));
						}
						pong_deadline = Some(Instant::now() + keepalive.pong_timeout);
					}
				}

				_ = sleep_until(deadline), if pong_deadline.is_some() => {
					break Err(ConnectionError::KeepaliveTimeout(keepalive.pong_timeout));
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						break Err(ConnectionError::Closed("stream ended".to_string()));
					};

					match msg {
						Ok(Message::Text(t)) => {
							pong_deadline = None;
							match machine.handle_text(t.as_str()) {
								Some(Action::Send(frame)) => {
									if let Err(e) = ws.send(Message::Text(frame.to_text().into())).await {
										break Err(ConnectionError::Write(e));
									}
								}
								Some(Action::Deliver(payload)) => self.deliver(&payload),
								None => {}
							}
						}
						// tungstenite queues the pong reply itself.
						Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
							pong_deadline = None;
						}
						Ok(Message::Close(frame)) => {
							let reason = frame
								.map(|f| format!("code={} reason={}", u16::from(f.code), f.reason.as_str()))
								.unwrap_or_else(|| "no close frame".to_string());
							break Err(ConnectionError::Closed(reason));
						}
						Ok(_) => {}
						Err(e) => break Err(ConnectionError::Read(e)),
					}
				}
			}
		};

		machine.close();
		if machine.dropped() > 0 {
			debug!(channel = %self.channel.name, dropped = machine.dropped(), "session ended with dropped frames");
		}
		result
	}
}
