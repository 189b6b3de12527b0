//! Entry Store Interface
//!
//! The entry store is the replicated backend that actually persists
//! segments. StreamLog consumes it through two traits:
//!
//! - `EntryStore`: create a new segment object, or open an existing one
//!   (optionally fencing out the current writer)
//! - `SegmentHandle`: append one transmission unit, read ranges of
//!   entries, and query the last-confirmed entry
//!
//! ## Fencing
//!
//! Opening a segment with `fence = true` permanently rejects further
//! appends from the segment's writer. This is the mechanism behind the
//! at-most-one-writer guarantee: a recovering writer fences its
//! predecessor's in-progress segment before completing it.
//!
//! ## Last-confirmed semantics
//!
//! The store advertises the highest entry readers are allowed to see.
//! While a segment is being written the advertised value lags one entry
//! behind the tail (acknowledging entry `n` advertises `n - 1`); fencing
//! or closing the segment advertises the true tail. This is why writers
//! emit control records: a follow-up append is what makes the previous
//! data visible to tailing readers.
//!
//! `MemEntryStore` is the in-memory implementation used by tests and
//! single-process deployments; it honors both behaviors above.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("segment store fenced this writer")]
    Fenced,

    #[error("segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("segment is closed")]
    SegmentClosed,

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether a retry against the same segment can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// One entry as returned by a range read.
#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_id: i64,
    pub payload: Bytes,
}

/// Factory for segment objects.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Create a fresh, writable segment.
    async fn create_segment(&self) -> StoreResult<Arc<dyn SegmentHandle>>;

    /// Open an existing segment. `fence = true` permanently rejects the
    /// writer's future appends and advertises the tail to readers.
    async fn open_segment(&self, store_id: u64, fence: bool) -> StoreResult<Arc<dyn SegmentHandle>>;
}

/// Operations on one opened segment.
#[async_trait]
pub trait SegmentHandle: Send + Sync {
    fn store_id(&self) -> u64;

    /// Append one transmission unit; returns the assigned entry id.
    async fn append(&self, payload: Bytes) -> StoreResult<i64>;

    /// Locally cached last-confirmed entry id (-1 if none).
    fn last_confirmed(&self) -> i64;

    /// Refresh the last-confirmed entry id from the store.
    async fn read_last_confirmed(&self) -> StoreResult<i64>;

    /// Read entries `first..=last` (bounded by what exists).
    async fn read_entries(&self, first_entry: i64, last_entry: i64) -> StoreResult<Vec<Entry>>;

    /// Seal the segment; readers may then see every entry.
    async fn close(&self) -> StoreResult<()>;
}

struct MemSegment {
    entries: Vec<Bytes>,
    last_confirmed: i64,
    fenced: bool,
    closed: bool,
}

/// In-memory entry store with real fencing and lagging last-confirmed.
pub struct MemEntryStore {
    segments: Mutex<HashMap<u64, Arc<Mutex<MemSegment>>>>,
    next_id: AtomicU64,
    fail_appends: Arc<AtomicBool>,
}

impl MemEntryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            segments: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fail_appends: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Test hook: make every subsequent append fail transiently.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    fn segment(&self, store_id: u64) -> StoreResult<Arc<Mutex<MemSegment>>> {
        self.segments
            .lock()
            .unwrap()
            .get(&store_id)
            .cloned()
            .ok_or(StoreError::SegmentNotFound(store_id))
    }
}

struct MemSegmentHandle {
    store_id: u64,
    segment: Arc<Mutex<MemSegment>>,
    fail_appends: Arc<AtomicBool>,
    cached_last_confirmed: AtomicI64,
}

#[async_trait]
impl EntryStore for MemEntryStore {
    async fn create_segment(&self) -> StoreResult<Arc<dyn SegmentHandle>> {
        let store_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let segment = Arc::new(Mutex::new(MemSegment {
            entries: Vec::new(),
            last_confirmed: -1,
            fenced: false,
            closed: false,
        }));
        self.segments
            .lock()
            .unwrap()
            .insert(store_id, Arc::clone(&segment));
        debug!(store_id, "segment created");
        Ok(Arc::new(MemSegmentHandle {
            store_id,
            segment,
            fail_appends: Arc::clone(&self.fail_appends),
            cached_last_confirmed: AtomicI64::new(-1),
        }))
    }

    async fn open_segment(&self, store_id: u64, fence: bool) -> StoreResult<Arc<dyn SegmentHandle>> {
        let segment = self.segment(store_id)?;
        let last_confirmed = {
            let mut locked = segment.lock().unwrap();
            if fence {
                // The writer's future appends are rejected from here on and
                // readers may see the whole tail.
                locked.fenced = true;
                locked.last_confirmed = locked.entries.len() as i64 - 1;
                debug!(store_id, tail = locked.last_confirmed, "segment fenced");
            }
            locked.last_confirmed
        };
        Ok(Arc::new(MemSegmentHandle {
            store_id,
            segment,
            fail_appends: Arc::clone(&self.fail_appends),
            cached_last_confirmed: AtomicI64::new(last_confirmed),
        }))
    }
}

#[async_trait]
impl SegmentHandle for MemSegmentHandle {
    fn store_id(&self) -> u64 {
        self.store_id
    }

    async fn append(&self, payload: Bytes) -> StoreResult<i64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("injected append failure".to_string()));
        }
        let mut segment = self.segment.lock().unwrap();
        if segment.fenced {
            return Err(StoreError::Fenced);
        }
        if segment.closed {
            return Err(StoreError::SegmentClosed);
        }
        segment.entries.push(payload);
        let entry_id = segment.entries.len() as i64 - 1;
        // Readers may see everything up to the previous entry.
        segment.last_confirmed = entry_id - 1;
        self.cached_last_confirmed
            .fetch_max(entry_id - 1, Ordering::SeqCst);
        Ok(entry_id)
    }

    fn last_confirmed(&self) -> i64 {
        self.cached_last_confirmed.load(Ordering::SeqCst)
    }

    async fn read_last_confirmed(&self) -> StoreResult<i64> {
        let last_confirmed = self.segment.lock().unwrap().last_confirmed;
        self.cached_last_confirmed
            .fetch_max(last_confirmed, Ordering::SeqCst);
        Ok(self.last_confirmed())
    }

    async fn read_entries(&self, first_entry: i64, last_entry: i64) -> StoreResult<Vec<Entry>> {
        if first_entry < 0 || last_entry < first_entry {
            return Err(StoreError::Other(format!(
                "bad entry range {}..={}",
                first_entry, last_entry
            )));
        }
        let segment = self.segment.lock().unwrap();
        let available = segment.entries.len() as i64;
        let last = last_entry.min(available - 1);
        let mut out = Vec::new();
        let mut entry_id = first_entry;
        while entry_id <= last {
            out.push(Entry {
                entry_id,
                payload: segment.entries[entry_id as usize].clone(),
            });
            entry_id += 1;
        }
        Ok(out)
    }

    async fn close(&self) -> StoreResult<()> {
        let mut segment = self.segment.lock().unwrap();
        segment.closed = true;
        segment.last_confirmed = segment.entries.len() as i64 - 1;
        self.cached_last_confirmed
            .fetch_max(segment.last_confirmed, Ordering::SeqCst);
        debug!(store_id = self.store_id, tail = segment.last_confirmed, "segment sealed");
        Ok(())
    }
}
