#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Tracked {
	name: String,
	handle: JoinHandle<()>,
}

struct Inner {
	tasks: Mutex<HashMap<u64, Tracked>>,
	next_id: AtomicU64,
	token: CancellationToken,
}

/// Removes its task's entry when the task future is dropped (completion, panic or abort).
struct Untrack {
	id: u64,
	inner: Weak<Inner>,
}

impl Drop for Untrack {
	fn drop(&mut self) {
		if let Some(inner) = self.inner.upgrade() {
			inner.tasks.lock().remove(&self.id);
		}
	}
}

/// Outcome of [`TaskSupervisor::cancel_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
	/// Tasks that exited on their own after the cancel signal.
	pub finished: usize,
	/// Tasks still running at the deadline and aborted.
	pub aborted: usize,
}

/// Tracks every background task of the process so shutdown can stop and await them all.
///
/// Tasks are expected to watch [`TaskSupervisor::token`] and return once it is cancelled.
#[derive(Clone)]
pub struct TaskSupervisor {
	inner: Arc<Inner>,
}

impl Default for TaskSupervisor {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for TaskSupervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TaskSupervisor")
			.field("active", &self.active_count())
			.field("cancelled", &self.inner.token.is_cancelled())
			.finish()
	}
}

impl TaskSupervisor {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				tasks: Mutex::new(HashMap::new()),
				next_id: AtomicU64::new(1),
				token: CancellationToken::new(),
			}),
		}
	}

	/// Shutdown signal shared by all supervised tasks.
	pub fn token(&self) -> CancellationToken {
		self.inner.token.clone()
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.token.is_cancelled()
	}

	/// Spawn and track `fut`; the entry disappears when the task ends.
	pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let name = name.into();
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let guard = Untrack {
			id,
			inner: Arc::downgrade(&self.inner),
		};
		let task_name = name.clone();

		// Insert under the lock so a task finishing immediately cannot untrack before it is tracked.
		let mut tasks = self.inner.tasks.lock();
		let handle = tokio::spawn(async move {
			let _guard = guard;
			fut.await;
			debug!(task = %task_name, "task finished");
		});
		tasks.insert(id, Tracked { name, handle });
	}

	pub fn active_count(&self) -> usize {
		self.inner.tasks.lock().len()
	}

	pub fn active_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.inner.tasks.lock().values().map(|t| t.name.clone()).collect();
		names.sort();
		names
	}

	/// Cancel every tracked task and wait for them to exit, aborting whatever is left at `deadline`.
	///
	/// On return the tracked set is empty.
	pub async fn cancel_all(&self, deadline: Duration) -> CancelReport {
		self.inner.token.cancel();

		let tracked: Vec<Tracked> = self.inner.tasks.lock().drain().map(|(_, t)| t).collect();
		if tracked.is_empty() {
			return CancelReport::default();
		}

		let names: Vec<String> = tracked.iter().map(|t| t.name.clone()).collect();
		let aborts: Vec<_> = tracked.iter().map(|t| t.handle.abort_handle()).collect();
		let total = tracked.len();
		debug!(count = total, "cancelling supervised tasks");

		let joined = tokio::time::timeout(deadline, join_all(tracked.into_iter().map(|t| t.handle))).await;
		let report = match joined {
			Ok(results) => {
				for (name, res) in names.iter().zip(results) {
					if matches!(res, Err(ref e) if e.is_panic()) {
						warn!(task = %name, "supervised task panicked");
					}
				}
				CancelReport {
					finished: total,
					aborted: 0,
				}
			}
			Err(_) => {
				let mut aborted = 0;
				for (name, abort) in names.iter().zip(aborts) {
					if !abort.is_finished() {
						warn!(task = %name, ?deadline, "task did not stop before deadline; aborting");
						abort.abort();
						aborted += 1;
					}
				}
				CancelReport {
					finished: total - aborted,
					aborted,
				}
			}
		};

		// Tasks spawned while we were waiting.
		let late: Vec<Tracked> = self.inner.tasks.lock().drain().map(|(_, t)| t).collect();
		for t in late {
			t.handle.abort();
		}

		report
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[tokio::test]
	async fn finished_tasks_untrack_themselves() {
		let sup = TaskSupervisor::new();
		let (tx, rx) = tokio::sync::oneshot::channel::<()>();
		sup.spawn("short", async move {
			let _ = rx.await;
		});
		assert_eq!(sup.active_count(), 1);
		assert_eq!(sup.active_names(), vec!["short".to_string()]);

		tx.send(()).expect("receiver alive");
		for _ in 0..100 {
			if sup.active_count() == 0 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert_eq!(sup.active_count(), 0);
	}

	#[tokio::test]
	async fn cancel_all_waits_for_cooperative_tasks() {
		let sup = TaskSupervisor::new();
		let stopped = Arc::new(AtomicUsize::new(0));
		for i in 0..5 {
			let token = sup.token();
			let stopped = Arc::clone(&stopped);
			sup.spawn(format!("worker-{i}"), async move {
				token.cancelled().await;
				tokio::task::yield_now().await;
				stopped.fetch_add(1, Ordering::SeqCst);
			});
		}
		assert_eq!(sup.active_count(), 5);

		let report = sup.cancel_all(Duration::from_secs(5)).await;
		assert_eq!(report, CancelReport { finished: 5, aborted: 0 });
		assert_eq!(stopped.load(Ordering::SeqCst), 5);
		assert_eq!(sup.active_count(), 0);
		assert!(sup.is_cancelled());
	}

	#[tokio::test]
	async fn cancel_all_aborts_stragglers_at_deadline() {
		let sup = TaskSupervisor::new();
		sup.spawn("stubborn", async {
			tokio::time::sleep(Duration::from_secs(3600)).await;
		});
		let token = sup.token();
		sup.spawn("polite", async move {
			token.cancelled().await;
		});

		let report = sup.cancel_all(Duration::from_millis(50)).await;
		assert_eq!(report.aborted, 1);
		assert_eq!(report.finished, 1);
		assert_eq!(sup.active_count(), 0);
	}

	#[tokio::test]
	async fn cancel_all_on_empty_supervisor() {
		let sup = TaskSupervisor::new();
		assert_eq!(sup.cancel_all(Duration::from_millis(10)).await, CancelReport::default());
		assert_eq!(sup.active_count(), 0);
	}
}
