//! Segment Handle Cache
//!
//! Process-shared cache of opened segment handles, keyed by
//! `(store_id, fenced)`. Readers and recovery paths funnel their opens
//! through here so a segment is opened against the entry store once, and
//! the uniform read operations can be issued without holding the handle.
//!
//! A fenced open and a plain open are distinct cache entries: fencing has
//! side effects and a reader must never trigger one by accident.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::entrystore::{Entry, EntryStore, SegmentHandle, StoreResult};

pub struct HandleCache {
    store: Arc<dyn EntryStore>,
    handles: Mutex<HashMap<(u64, bool), Arc<dyn SegmentHandle>>>,
}

impl HandleCache {
    pub fn new(store: Arc<dyn EntryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or reuse) a handle on a segment.
    pub async fn open(&self, store_id: u64, fence: bool) -> StoreResult<Arc<dyn SegmentHandle>> {
        {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(&(store_id, fence)) {
                return Ok(Arc::clone(handle));
            }
        }
        let handle = self.store.open_segment(store_id, fence).await?;
        let mut handles = self.handles.lock().await;
        Ok(Arc::clone(
            handles.entry((store_id, fence)).or_insert(handle),
        ))
    }

    /// Refresh last-confirmed through a cached handle.
    pub async fn read_last_confirmed(&self, store_id: u64, fence: bool) -> StoreResult<i64> {
        self.open(store_id, fence).await?.read_last_confirmed().await
    }

    /// Range-read entries through a cached handle.
    pub async fn read_entries(
        &self,
        store_id: u64,
        fence: bool,
        first_entry: i64,
        last_entry: i64,
    ) -> StoreResult<Vec<Entry>> {
        self.open(store_id, fence)
            .await?
            .read_entries(first_entry, last_entry)
            .await
    }

    /// Drop the cached handles for one segment.
    pub async fn evict(&self, store_id: u64) {
        let mut handles = self.handles.lock().await;
        handles.remove(&(store_id, false));
        handles.remove(&(store_id, true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrystore::MemEntryStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_open_reuses_handle() {
        let store = MemEntryStore::new();
        let created = store.create_segment().await.unwrap();
        let cache = HandleCache::new(store);

        let a = cache.open(created.store_id(), false).await.unwrap();
        let b = cache.open(created.store_id(), false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_fenced_and_plain_are_distinct() {
        let store = MemEntryStore::new();
        let created = store.create_segment().await.unwrap();
        created.append(Bytes::from("e0")).await.unwrap();
        let cache = HandleCache::new(store);

        let plain = cache.open(created.store_id(), false).await.unwrap();
        let fenced = cache.open(created.store_id(), true).await.unwrap();
        assert!(!Arc::ptr_eq(&plain, &fenced));
        // The fenced open sealed the segment for the writer.
        assert!(created.append(Bytes::from("e1")).await.is_err());
    }

    #[tokio::test]
    async fn test_uniform_reads() {
        let store = MemEntryStore::new();
        let created = store.create_segment().await.unwrap();
        created.append(Bytes::from("e0")).await.unwrap();
        created.append(Bytes::from("e1")).await.unwrap();
        created.close().await.unwrap();
        let cache = HandleCache::new(store);

        let lac = cache
            .read_last_confirmed(created.store_id(), false)
            .await
            .unwrap();
        assert_eq!(lac, 1);
        let entries = cache
            .read_entries(created.store_id(), false, 0, lac)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_evict_reopens() {
        let store = MemEntryStore::new();
        let created = store.create_segment().await.unwrap();
        let cache = HandleCache::new(store);

        let a = cache.open(created.store_id(), false).await.unwrap();
        cache.evict(created.store_id()).await;
        let b = cache.open(created.store_id(), false).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
