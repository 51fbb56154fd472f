#![forbid(unsafe_code)]

use std::collections::VecDeque;

/// Fixed-capacity FIFO that evicts its oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
	items: VecDeque<T>,
	capacity: usize,
	evicted_total: u64,
}

impl<T> BoundedQueue<T> {
	/// A capacity of zero is raised to one.
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			items: VecDeque::with_capacity(capacity),
			capacity,
			evicted_total: 0,
		}
	}

	/// Append `item`, dropping the oldest entry first when full. Returns `true` if an entry was evicted.
	pub fn put(&mut self, item: T) -> bool {
		let evicted = if self.items.len() >= self.capacity {
			self.items.pop_front();
			self.evicted_total = self.evicted_total.saturating_add(1);
			true
		} else {
			false
		};
		self.items.push_back(item);
		evicted
	}

	/// Pop the oldest entry.
	pub fn get(&mut self) -> Option<T> {
		self.items.pop_front()
	}

	pub fn size(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Entries dropped by overflow since creation.
	pub fn evicted_total(&self) -> u64 {
		self.evicted_total
	}

	pub fn clear(&mut self) {
		self.items.clear();
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn overflow_evicts_oldest() {
		let mut q = BoundedQueue::new(3);
		assert!(!q.put(1));
		assert!(!q.put(2));
		assert!(!q.put(3));
		assert!(q.put(4));
		assert_eq!(q.size(), 3);
		assert_eq!(q.evicted_total(), 1);
		assert_eq!(q.get(), Some(2));
		assert_eq!(q.get(), Some(3));
		assert_eq!(q.get(), Some(4));
		assert_eq!(q.get(), None);
	}

	#[test]
	fn clear_empties_but_keeps_eviction_count() {
		let mut q = BoundedQueue::new(1);
		q.put("a");
		q.put("b");
		q.clear();
		assert!(q.is_empty());
		assert_eq!(q.evicted_total(), 1);
	}

	#[test]
	fn zero_capacity_holds_one() {
		let mut q = BoundedQueue::new(0);
		q.put(1);
		q.put(2);
		assert_eq!(q.capacity(), 1);
		assert_eq!(q.get(), Some(2));
	}

	proptest! {
		#[test]
		fn size_never_exceeds_capacity(cap in 1usize..32, items in proptest::collection::vec(any::<u16>(), 0..128)) {
			let mut q = BoundedQueue::new(cap);
			for (i, item) in items.iter().enumerate() {
				let evicted = q.put(*item);
				prop_assert!(q.size() <= cap);
				prop_assert_eq!(evicted, i >= cap);
			}
			let expected: Vec<u16> = items.iter().copied().skip(items.len().saturating_sub(cap)).collect();
			let mut drained = Vec::new();
			while let Some(v) = q.get() {
				drained.push(v);
			}
			prop_assert_eq!(drained, expected);
		}
	}
}
