//! Read-Ahead Worker
//!
//! Background task that tails one segment: it polls the entry store's
//! last-confirmed pointer and prefetches batches of entries into the
//! shared entry cache so the reader almost never touches the store on its
//! own. The batch size grows exponentially after each successful fill up
//! to a configured ceiling, and shrinks back to the initial size when the
//! worker catches up.
//!
//! After every pass - fruitful or not - the worker pokes the reader's
//! notify handle. That wakeup is what drives both tail delivery and the
//! reader's idle-time accounting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::EntryCache;
use crate::entrystore::SegmentHandle;

#[derive(Debug, Clone)]
struct ReadAheadStatus {
    next_entry: i64,
    last_confirmed: i64,
    batch_size: usize,
    entries_cached: u64,
    read_errors: u64,
}

pub struct ReadAheadWorker {
    status: Arc<Mutex<ReadAheadStatus>>,
    task: JoinHandle<()>,
}

impl ReadAheadWorker {
    pub fn start(
        handle: Arc<dyn SegmentHandle>,
        cache: Arc<EntryCache>,
        notify: Arc<Notify>,
        start_entry: i64,
        batch_size: usize,
        max_batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let max_batch_size = max_batch_size.max(batch_size);
        let status = Arc::new(Mutex::new(ReadAheadStatus {
            next_entry: start_entry,
            last_confirmed: -1,
            batch_size,
            entries_cached: 0,
            read_errors: 0,
        }));

        let task = {
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                loop {
                    let last_confirmed = match handle.read_last_confirmed().await {
                        Ok(lac) => lac,
                        Err(e) => {
                            warn!(store_id = handle.store_id(), error = %e, "read-ahead poll failed");
                            status.lock().unwrap().read_errors += 1;
                            notify.notify_one();
                            tokio::time::sleep(poll_interval).await;
                            continue;
                        }
                    };
                    let (next, batch) = {
                        let mut s = status.lock().unwrap();
                        s.last_confirmed = last_confirmed;
                        (s.next_entry, s.batch_size)
                    };
                    if next <= last_confirmed {
                        let last = (next + batch as i64 - 1).min(last_confirmed);
                        match handle.read_entries(next, last).await {
                            Ok(entries) => {
                                let fetched = entries.len() as u64;
                                for entry in entries {
                                    cache.put(handle.store_id(), entry.entry_id, entry.payload);
                                }
                                let mut s = status.lock().unwrap();
                                s.next_entry = last + 1;
                                s.entries_cached += fetched;
                                s.batch_size = (s.batch_size * 2).min(max_batch_size);
                                debug!(
                                    store_id = handle.store_id(),
                                    first = next,
                                    last,
                                    batch = s.batch_size,
                                    "read-ahead fetched entries"
                                );
                                notify.notify_one();
                            }
                            Err(e) => {
                                warn!(store_id = handle.store_id(), error = %e, "read-ahead fetch failed");
                                status.lock().unwrap().read_errors += 1;
                                notify.notify_one();
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    } else {
                        // Caught up with the visible tail.
                        status.lock().unwrap().batch_size = batch_size;
                        notify.notify_one();
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            })
        };
        Self { status, task }
    }

    /// Log the worker's state; used when the reader goes idle.
    pub fn dump_state(&self, as_error: bool) {
        let status = self.status.lock().unwrap().clone();
        if as_error {
            error!(
                next_entry = status.next_entry,
                last_confirmed = status.last_confirmed,
                batch_size = status.batch_size,
                entries_cached = status.entries_cached,
                read_errors = status.read_errors,
                "read-ahead state"
            );
        } else {
            warn!(
                next_entry = status.next_entry,
                last_confirmed = status.last_confirmed,
                batch_size = status.batch_size,
                entries_cached = status.entries_cached,
                read_errors = status.read_errors,
                "read-ahead state"
            );
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ReadAheadWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrystore::{EntryStore, MemEntryStore};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_prefetches_visible_entries() {
        let store = MemEntryStore::new();
        let writer = store.create_segment().await.unwrap();
        for i in 0..5 {
            writer.append(Bytes::from(format!("entry-{}", i))).await.unwrap();
        }
        // Entries 0..=3 are visible (last-confirmed lags by one).
        let reader_handle = store.open_segment(writer.store_id(), false).await.unwrap();
        let cache = Arc::new(EntryCache::new(64));
        let notify = Arc::new(Notify::new());

        let worker = ReadAheadWorker::start(
            reader_handle,
            Arc::clone(&cache),
            Arc::clone(&notify),
            0,
            2,
            8,
            Duration::from_millis(10),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get(writer.store_id(), 3).is_none() {
                notify.notified().await;
            }
        })
        .await
        .expect("read-ahead should cache the visible tail");

        assert_eq!(
            cache.get(writer.store_id(), 0),
            Some(Bytes::from("entry-0"))
        );
        assert!(cache.get(writer.store_id(), 4).is_none(), "entry 4 not visible yet");
        worker.stop();
    }

    #[tokio::test]
    async fn test_follows_tail_as_it_advances() {
        let store = MemEntryStore::new();
        let writer = store.create_segment().await.unwrap();
        writer.append(Bytes::from("e0")).await.unwrap();
        let reader_handle = store.open_segment(writer.store_id(), false).await.unwrap();
        let cache = Arc::new(EntryCache::new(64));
        let notify = Arc::new(Notify::new());

        let _worker = ReadAheadWorker::start(
            reader_handle,
            Arc::clone(&cache),
            Arc::clone(&notify),
            0,
            2,
            8,
            Duration::from_millis(5),
        );

        writer.append(Bytes::from("e1")).await.unwrap();
        writer.append(Bytes::from("e2")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get(writer.store_id(), 1).is_none() {
                notify.notified().await;
            }
        })
        .await
        .expect("read-ahead should pick up new entries");
    }
}
