//! Segment Record Reader
//!
//! Reads one segment's records in order, resuming across the moving tail
//! of an in-progress segment. The reader positions itself with a
//! header-only skip, serves entries from the shared read-ahead cache when
//! it can, and falls back to a direct store read when a record is needed
//! urgently (blocking mode).
//!
//! While the segment is in progress the reader keeps a one-shot
//! completion watch on the segment's coordinator node: deletion of the
//! in-progress marker means the writer completed the segment, at which
//! point the reader refreshes last-confirmed one final time and treats
//! the segment as sealed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use streamlog_core::{EntryReader, Position, PositionedRecord};
use streamlog_metadata::{SegmentMetadata, SegmentMetadataStore};

use crate::cache::EntryCache;
use crate::entrystore::SegmentHandle;
use crate::error::Result;

pub struct SegmentRecordReader {
    metadata: SegmentMetadata,
    handle: Arc<dyn SegmentHandle>,
    cache: Arc<EntryCache>,
    metadata_store: Arc<SegmentMetadataStore>,
    notify: Arc<Notify>,
    in_progress: bool,
    next_entry_id: i64,
    last_confirmed: i64,
    current_entry: Option<EntryReader>,
    /// Consumed when the first entry is opened.
    skip_target: Option<Position>,
    watch_set: bool,
    completion_fired: Arc<AtomicBool>,
    should_resume: bool,
}

impl SegmentRecordReader {
    /// Open a reader positioned at the first record with
    /// `position >= start`.
    pub async fn open(
        metadata: SegmentMetadata,
        handle: Arc<dyn SegmentHandle>,
        cache: Arc<EntryCache>,
        metadata_store: Arc<SegmentMetadataStore>,
        notify: Arc<Notify>,
        start: Position,
    ) -> Result<Self> {
        let last_confirmed = handle.read_last_confirmed().await?;
        let next_entry_id = if start.segment_seq() == metadata.segment_seq {
            start.entry_id().max(0)
        } else {
            0
        };
        let mut reader = Self {
            in_progress: metadata.is_in_progress(),
            metadata,
            handle,
            cache,
            metadata_store,
            notify,
            next_entry_id,
            last_confirmed,
            current_entry: None,
            skip_target: Some(start),
            watch_set: false,
            completion_fired: Arc::new(AtomicBool::new(false)),
            should_resume: true,
        };
        reader.resume().await?;
        Ok(reader)
    }

    pub fn segment_seq(&self) -> i64 {
        self.metadata.segment_seq
    }

    pub fn next_entry_id(&self) -> i64 {
        self.next_entry_id
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Ask the next `resume` call to refresh tail state.
    pub fn require_resume(&mut self) {
        self.should_resume = true;
    }

    /// Refresh the visible tail: arm the completion watch, pick up a
    /// fired completion, and re-read last-confirmed when we have caught
    /// up with the cached value.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.should_resume {
            return Ok(());
        }
        if self.in_progress && !self.watch_set {
            match self
                .metadata_store
                .watch_completion(self.metadata.segment_seq)
                .await
            {
                Ok(watch) => {
                    self.watch_set = true;
                    let fired = Arc::clone(&self.completion_fired);
                    let notify = Arc::clone(&self.notify);
                    tokio::spawn(async move {
                        // Either the node was deleted or the watch itself
                        // died; both mean "look again".
                        let _ = watch.await;
                        fired.store(true, Ordering::SeqCst);
                        notify.notify_one();
                    });
                }
                Err(e) => {
                    warn!(
                        segment_seq = self.metadata.segment_seq,
                        error = %e,
                        "unable to arm completion watch"
                    );
                }
            }
        }

        if self.completion_fired.swap(false, Ordering::SeqCst) && self.in_progress {
            self.last_confirmed = self.handle.read_last_confirmed().await?;
            self.in_progress = false;
            debug!(
                segment_seq = self.metadata.segment_seq,
                tail = self.last_confirmed,
                "segment completed under the reader"
            );
        } else if self.in_progress && self.next_entry_id > self.last_confirmed {
            self.last_confirmed = self.handle.read_last_confirmed().await?;
        }
        self.should_resume = false;
        Ok(())
    }

    /// Next record in this segment, or `None` when nothing more is
    /// visible. In non-blocking mode a cache miss also yields `None`.
    pub async fn read_record(&mut self, nonblocking: bool) -> Result<Option<PositionedRecord>> {
        loop {
            if let Some(entry) = &mut self.current_entry {
                if let Some(target) = self.skip_target.take() {
                    entry.skip_to(&target)?;
                }
                if let Some(record) = entry.read_record()? {
                    return Ok(Some(record));
                }
                self.current_entry = None;
            }

            if self.next_entry_id > self.last_confirmed {
                return Ok(None);
            }

            let store_id = self.handle.store_id();
            let payload = match self.cache.get(store_id, self.next_entry_id) {
                Some(payload) => Some(payload),
                None if nonblocking => None,
                None => {
                    let entries = self
                        .handle
                        .read_entries(self.next_entry_id, self.next_entry_id)
                        .await?;
                    entries.into_iter().next().map(|entry| {
                        self.cache.put(store_id, entry.entry_id, entry.payload.clone());
                        entry.payload
                    })
                }
            };
            match payload {
                Some(payload) => {
                    self.current_entry = Some(EntryReader::new(
                        self.metadata.segment_seq,
                        self.next_entry_id,
                        payload,
                    ));
                    self.next_entry_id += 1;
                }
                None => return Ok(None),
            }
        }
    }

    /// True once a sealed segment has been drained to its tail.
    pub fn reached_end_of_segment(&self) -> bool {
        !self.in_progress && self.current_entry.is_none() && self.next_entry_id > self.last_confirmed
    }
}
