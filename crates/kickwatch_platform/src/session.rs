#![forbid(unsafe_code)]

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str =
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SessionConfig {
	pub user_agent: String,
	/// Upper bound on requests in flight through the shared client.
	pub max_connections: usize,
	pub request_timeout: Duration,
	pub connect_timeout: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			user_agent: DEFAULT_USER_AGENT.to_string(),
			max_connections: 100,
			request_timeout: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

/// Lazily created HTTP client shared by every component that talks HTTP.
///
/// The client is built on first use, dropped by [`SessionPool::cleanup`] and rebuilt on the next
/// [`SessionPool::acquire`].
pub struct SessionPool {
	cfg: SessionConfig,
	client: Mutex<Option<reqwest::Client>>,
	permits: Arc<Semaphore>,
	created: AtomicU64,
}

/// A checked-out client. Holding it counts against the pool's connection limit.
pub struct Session {
	client: reqwest::Client,
	_permit: OwnedSemaphorePermit,
}

impl Deref for Session {
	type Target = reqwest::Client;

	fn deref(&self) -> &Self::Target {
		&self.client
	}
}

impl SessionPool {
	pub fn new(cfg: SessionConfig) -> Self {
		let limit = cfg.max_connections.max(1);
		Self {
			cfg,
			client: Mutex::new(None),
			permits: Arc::new(Semaphore::new(limit)),
			created: AtomicU64::new(0),
		}
	}

	pub fn config(&self) -> &SessionConfig {
		&self.cfg
	}

	fn build_client(&self) -> anyhow::Result<reqwest::Client> {
		reqwest::Client::builder()
			.user_agent(self.cfg.user_agent.clone())
			.timeout(self.cfg.request_timeout)
			.connect_timeout(self.cfg.connect_timeout)
			.pool_max_idle_per_host(self.cfg.max_connections)
			.build()
			.context("build http client")
	}

	/// Check out the shared client, creating it if needed.
	pub async fn acquire(&self) -> anyhow::Result<Session> {
		let permit = Arc::clone(&self.permits)
			.acquire_owned()
			.await
			.context("session pool closed")?;

		let client = {
			let mut guard = self.client.lock().await;
			match guard.as_ref() {
				Some(c) => c.clone(),
				None => {
					let c = self.build_client()?;
					let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
					debug!(clients_created = n, "http client created");
					*guard = Some(c.clone());
					c
				}
			}
		};

		Ok(Session {
			client,
			_permit: permit,
		})
	}

	/// Drop the shared client. Outstanding [`Session`]s keep working until released.
	pub async fn cleanup(&self) {
		if self.client.lock().await.take().is_some() {
			debug!("http client released");
		}
	}

	pub async fn is_open(&self) -> bool {
		self.client.lock().await.is_some()
	}

	/// Number of clients built over the pool's lifetime.
	pub fn clients_created(&self) -> u64 {
		self.created.load(Ordering::Relaxed)
	}
}
