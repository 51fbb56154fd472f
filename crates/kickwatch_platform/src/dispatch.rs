#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kickwatch_domain::Notification;
use kickwatch_util::breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use kickwatch_util::queue::BoundedQueue;
use kickwatch_util::tasks::TaskSupervisor;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("unexpected status {status}")]
	Status { status: u16 },
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("unexpected status {status}")]
	Status { status: u16 },
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("{collaborator} timed out after {timeout:?}")]
	Timeout {
		collaborator: &'static str,
		timeout: Duration,
	},
	#[error("{collaborator} circuit open; retry after {retry_after:?}")]
	CircuitOpen {
		collaborator: &'static str,
		retry_after: Duration,
	},
	#[error("notifier failed: {0}")]
	Delivery(#[source] DeliveryError),
	#[error("persister failed: {0}")]
	Persistence(#[source] PersistenceError),
}

/// Renders and delivers a notification somewhere a human will see it.
#[async_trait]
pub trait Notifier: Send + Sync {
	fn name(&self) -> &'static str {
		"notifier"
	}

	async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Durably records a notification.
#[async_trait]
pub trait Persister: Send + Sync {
	fn name(&self) -> &'static str {
		"persister"
	}

	async fn save(&self, notification: &Notification) -> Result<(), PersistenceError>;
}

/// Non-blocking hand-off point used by channel readers.
pub trait NotificationSink: Send + Sync {
	fn submit(&self, notification: Notification);
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
	pub queue_capacity: usize,
	pub workers: usize,
	pub notifier_timeout: Duration,
	pub persister_timeout: Duration,
	pub breaker: CircuitBreakerConfig,
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1000,
			workers: 4,
			notifier_timeout: Duration::from_secs(12),
			persister_timeout: Duration::from_secs(20),
			breaker: CircuitBreakerConfig::default(),
		}
	}
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
	pub submitted: u64,
	pub evicted: u64,
	pub delivered: u64,
	pub persisted: u64,
	pub delivery_failures: u64,
	pub persistence_failures: u64,
}

#[derive(Default)]
struct Counters {
	submitted: AtomicU64,
	delivered: AtomicU64,
	persisted: AtomicU64,
	delivery_failures: AtomicU64,
	persistence_failures: AtomicU64,
}

struct Shared {
	cfg: DispatchConfig,
	notifier: Arc<dyn Notifier>,
	persister: Arc<dyn Persister>,
	notifier_breaker: CircuitBreaker,
	persister_breaker: CircuitBreaker,
	queue: Mutex<BoundedQueue<Notification>>,
	wake: Notify,
	counters: Counters,
}

/// Fans notifications out to the notifier and the persister, isolating their failures.
///
/// Readers [`submit`](NotificationSink::submit) into a bounded queue that a fixed pool of
/// workers drains; a full queue drops its oldest entry.
#[derive(Clone)]
pub struct NotificationDispatcher {
	shared: Arc<Shared>,
}

impl NotificationDispatcher {
	pub fn new(cfg: DispatchConfig, notifier: Arc<dyn Notifier>, persister: Arc<dyn Persister>) -> Self {
		let notifier_breaker = CircuitBreaker::new(notifier.name(), cfg.breaker);
		let persister_breaker = CircuitBreaker::new(persister.name(), cfg.breaker);
		let queue = Mutex::new(BoundedQueue::new(cfg.queue_capacity));
		Self {
			shared: Arc::new(Shared {
				cfg,
				notifier,
				persister,
				notifier_breaker,
				persister_breaker,
				queue,
				wake: Notify::new(),
				counters: Counters::default(),
			}),
		}
	}

	/// Spawn the worker pool under `tasks`.
	pub fn start(&self, tasks: &TaskSupervisor) {
		let workers = self.shared.cfg.workers.max(1);
		for idx in 0..workers {
			let shared = Arc::clone(&self.shared);
			let token = tasks.token();
			tasks.spawn(format!("dispatch-worker-{idx}"), run_worker(shared, token, idx));
		}
		info!(workers, capacity = self.shared.cfg.queue_capacity, "notification dispatcher started");
	}

	/// Deliver one notification right away, bypassing the queue.
	pub async fn dispatch(&self, notification: &Notification) {
		self.shared.dispatch(notification).await;
	}

	pub fn pending(&self) -> usize {
		self.shared.queue.lock().size()
	}

	pub fn notifier_breaker(&self) -> &CircuitBreaker {
		&self.shared.notifier_breaker
	}

	pub fn persister_breaker(&self) -> &CircuitBreaker {
		&self.shared.persister_breaker
	}

	pub fn stats(&self) -> DispatchStats {
		let c = &self.shared.counters;
		DispatchStats {
			submitted: c.submitted.load(Ordering::Relaxed),
			evicted: self.shared.queue.lock().evicted_total(),
			delivered: c.delivered.load(Ordering::Relaxed),
			persisted: c.persisted.load(Ordering::Relaxed),
			delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
			persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
		}
	}
}

impl NotificationSink for NotificationDispatcher {
	fn submit(&self, notification: Notification) {
		self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
		metrics::counter!(
			"kickwatch_notifications_total",
			"type" => notification.message_type().as_str()
		)
		.increment(1);

		let (evicted, size) = {
			let mut q = self.shared.queue.lock();
			let evicted = q.put(notification);
			(evicted, q.size())
		};
		if evicted {
			metrics::counter!("kickwatch_dispatch_queue_evicted_total").increment(1);
			warn!(queue_size = size, "dispatch queue full; dropped oldest notification");
		}
		self.shared.wake.notify_one();
	}
}

impl Shared {
	async fn dispatch(&self, n: &Notification) {
		let channel = n.channel().name.as_str();
		let (sent, saved) = tokio::join!(self.send(n), self.save(n));

		match sent {
			Ok(()) => {
				self.counters.delivered.fetch_add(1, Ordering::Relaxed);
				debug!(%channel, sender = %n.message.sender, "notification delivered");
			}
			Err(e) => {
				self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("kickwatch_dispatch_failures_total", "collaborator" => "notifier").increment(1);
				warn!(%channel, error = %e, "notification delivery failed");
			}
		}
		match saved {
			Ok(()) => {
				self.counters.persisted.fetch_add(1, Ordering::Relaxed);
			}
			Err(e) => {
				self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("kickwatch_dispatch_failures_total", "collaborator" => "persister").increment(1);
				warn!(%channel, error = %e, "notification persistence failed");
			}
		}
	}

	async fn send(&self, n: &Notification) -> Result<(), DispatchError> {
		let timeout = self.cfg.notifier_timeout;
		let res = self
			.notifier_breaker
			.call(|| async {
				match tokio::time::timeout(timeout, self.notifier.send(n)).await {
					Ok(r) => r.map_err(DispatchError::Delivery),
					Err(_) => Err(DispatchError::Timeout {
						collaborator: self.notifier.name(),
						timeout,
					}),
				}
			})
			.await;
		flatten(res, self.notifier.name())
	}

	async fn save(&self, n: &Notification) -> Result<(), DispatchError> {
		let timeout = self.cfg.persister_timeout;
		let res = self
			.persister_breaker
			.call(|| async {
				match tokio::time::timeout(timeout, self.persister.save(n)).await {
					Ok(r) => r.map_err(DispatchError::Persistence),
					Err(_) => Err(DispatchError::Timeout {
						collaborator: self.persister.name(),
						timeout,
					}),
				}
			})
			.await;
		flatten(res, self.persister.name())
	}
}

fn flatten(res: Result<(), BreakerError<DispatchError>>, collaborator: &'static str) -> Result<(), DispatchError> {
	match res {
		Ok(()) => Ok(()),
		Err(BreakerError::Open { retry_after, .. }) => Err(DispatchError::CircuitOpen {
			collaborator,
			retry_after,
		}),
		Err(BreakerError::Inner(e)) => Err(e),
	}
}

/// Drains the queue; once cancelled, finishes what is left and exits.
async fn run_worker(shared: Arc<Shared>, token: CancellationToken, idx: usize) {
	loop {
		let next = shared.queue.lock().get();
		match next {
			Some(n) => shared.dispatch(&n).await,
			None => {
				if token.is_cancelled() {
					break;
				}
				tokio::select! {
					_ = shared.wake.notified() => {}
					_ = token.cancelled() => {}
				}
			}
		}
	}
	debug!(worker = idx, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use kickwatch_domain::{Channel, ChannelName, ChatroomId, MessageType, NotificationMessage, Platform};
	use kickwatch_util::breaker::CircuitBreakerState;

	use super::*;

	#[derive(Clone, Copy)]
	enum Behavior {
		Succeed,
		Fail,
		Hang,
	}

	struct Fake {
		behavior: Behavior,
		calls: AtomicUsize,
		seen: Mutex<Vec<String>>,
	}

	impl Fake {
		fn new(behavior: Behavior) -> Arc<Self> {
			Arc::new(Self {
				behavior,
				calls: AtomicUsize::new(0),
				seen: Mutex::new(Vec::new()),
			})
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}

		async fn run(&self, n: &Notification) -> anyhow::Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			match self.behavior {
				Behavior::Succeed => {
					self.seen.lock().push(n.message.content.clone());
					Ok(())
				}
				Behavior::Fail => Err(anyhow::anyhow!("down")),
				Behavior::Hang => std::future::pending().await,
			}
		}
	}

	#[async_trait]
	impl Notifier for Fake {
		async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
			Ok(self.run(n).await?)
		}
	}

	#[async_trait]
	impl Persister for Fake {
		async fn save(&self, n: &Notification) -> Result<(), PersistenceError> {
			Ok(self.run(n).await?)
		}
	}

	fn notification(content: &str) -> Notification {
		let channel = Channel::new(Platform::Kick, ChannelName::new("testchan").unwrap(), ChatroomId::new(1));
		Notification {
			message: NotificationMessage {
				content: content.to_string(),
				sender: "alice".to_string(),
				timestamp: "2024-01-01T00:00:00Z".to_string(),
				channel: channel.clone(),
				message_type: MessageType::Mention,
			},
			original_message: None,
			url: channel.url(),
		}
	}

	fn config() -> DispatchConfig {
		DispatchConfig {
			queue_capacity: 8,
			workers: 2,
			notifier_timeout: Duration::from_secs(1),
			persister_timeout: Duration::from_secs(2),
			breaker: CircuitBreakerConfig {
				failure_threshold: 2,
				recovery_timeout: Duration::from_secs(60),
			},
		}
	}

	#[tokio::test]
	async fn notifier_failure_does_not_block_persistence() {
		let notifier = Fake::new(Behavior::Fail);
		let persister = Fake::new(Behavior::Succeed);
		let d = NotificationDispatcher::new(config(), notifier.clone(), persister.clone());

		d.dispatch(&notification("@bob hi")).await;

		let s = d.stats();
		assert_eq!(s.delivery_failures, 1);
		assert_eq!(s.persisted, 1);
		assert_eq!(persister.seen.lock().as_slice(), ["@bob hi".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn hung_persister_times_out() {
		let notifier = Fake::new(Behavior::Succeed);
		let persister = Fake::new(Behavior::Hang);
		let d = NotificationDispatcher::new(config(), notifier.clone(), persister.clone());

		d.dispatch(&notification("x")).await;

		let s = d.stats();
		assert_eq!(s.delivered, 1);
		assert_eq!(s.persistence_failures, 1);
		assert_eq!(d.persister_breaker().failure_count(), 1);
	}

	#[tokio::test]
	async fn open_breaker_stops_calling_the_notifier() {
		let notifier = Fake::new(Behavior::Fail);
		let persister = Fake::new(Behavior::Succeed);
		let d = NotificationDispatcher::new(config(), notifier.clone(), persister.clone());

		for _ in 0..4 {
			d.dispatch(&notification("x")).await;
		}

		assert_eq!(d.notifier_breaker().state(), CircuitBreakerState::Open);
		assert_eq!(notifier.calls(), 2);
		assert_eq!(d.stats().delivery_failures, 4);
		assert_eq!(persister.calls(), 4);
	}

	#[tokio::test]
	async fn overflow_is_counted() {
		let d = NotificationDispatcher::new(config(), Fake::new(Behavior::Succeed), Fake::new(Behavior::Succeed));
		for i in 0..10 {
			d.submit(notification(&format!("m{i}")));
		}
		let s = d.stats();
		assert_eq!(s.submitted, 10);
		assert_eq!(s.evicted, 2);
		assert_eq!(d.pending(), 8);
	}

	#[tokio::test]
	async fn workers_drain_queue_on_shutdown() {
		let notifier = Fake::new(Behavior::Succeed);
		let persister = Fake::new(Behavior::Succeed);
		let d = NotificationDispatcher::new(config(), notifier.clone(), persister.clone());
		for i in 0..6 {
			d.submit(notification(&format!("m{i}")));
		}

		let tasks = TaskSupervisor::new();
		d.start(&tasks);
		let report = tasks.cancel_all(Duration::from_secs(5)).await;

		assert_eq!(report.aborted, 0);
		assert_eq!(tasks.active_count(), 0);
		assert_eq!(d.pending(), 0);
		assert_eq!(d.stats().delivered, 6);
		let mut seen = notifier.seen.lock().clone();
		seen.sort();
		assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
	}

	#[tokio::test]
	async fn submitted_work_is_picked_up_by_running_workers() {
		let notifier = Fake::new(Behavior::Succeed);
		let d = NotificationDispatcher::new(config(), notifier.clone(), Fake::new(Behavior::Succeed));
		let tasks = TaskSupervisor::new();
		d.start(&tasks);

		d.submit(notification("late"));
		for _ in 0..200 {
			if d.stats().delivered == 1 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert_eq!(d.stats().delivered, 1);
		tasks.cancel_all(Duration::from_secs(1)).await;
	}
}
