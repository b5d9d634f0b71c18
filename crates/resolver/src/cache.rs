use std::{
	num::NonZeroUsize,
	sync::Mutex,
	time::{Duration, Instant},
};

use lru::LruCache;

/// TTL'd LRU over resolver lookups. Writers that advance coverage
/// invalidate their (dataset, era) entry; everything else ages out.
pub struct TtlCache<V> {
	entries: Mutex<LruCache<String, (Instant, V)>>,
	ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
	pub fn new(capacity: usize, ttl: Duration) -> Self {
		Self {
			entries: Mutex::new(LruCache::new(
				NonZeroUsize::new(capacity.max(1)).unwrap(),
			)),
			ttl,
		}
	}

	pub fn get(&self, key: &str) -> Option<V> {
		let mut entries = self.entries.lock().unwrap();
		match entries.get(key) {
			Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
			Some(_) => {
				entries.pop(key);
				None
			},
			None => None,
		}
	}

	pub fn put(&self, key: String, value: V) {
		self.entries.lock().unwrap().put(key, (Instant::now(), value));
	}

	pub fn invalidate(&self, key: &str) {
		self.entries.lock().unwrap().pop(key);
	}
}
