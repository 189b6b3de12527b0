//! Entry Cache
//!
//! Bounded LRU of fetched entries keyed by `(store_id, entry_id)`. The
//! read-ahead worker fills it ahead of the reader; the segment reader
//! serves from it and falls back to a direct store read only when a record
//! is urgently required.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;

pub struct EntryCache {
    inner: Mutex<LruCache<(u64, i64), Bytes>>,
}

impl EntryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, store_id: u64, entry_id: i64) -> Option<Bytes> {
        self.inner.lock().unwrap().get(&(store_id, entry_id)).cloned()
    }

    pub fn put(&self, store_id: u64, entry_id: i64, payload: Bytes) {
        self.inner.lock().unwrap().put((store_id, entry_id), payload);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
