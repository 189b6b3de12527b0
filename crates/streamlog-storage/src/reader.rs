//! Log Reader
//!
//! Stream-level continuous reader plus its async facade.
//!
//! `ContinuousLogReader` opens segments in order, drives one
//! `SegmentRecordReader` at a time, rolls to the next segment when the
//! current one is sealed and drained, and tracks reader-idle time. While a
//! segment is in progress a read-ahead worker tails it into the shared
//! entry cache.
//!
//! `LogReader` is the user-facing async surface: `read_next` and
//! `read_bulk` park one-shot promises on a FIFO, and a single-shot
//! background task advances the stream until every parked promise is
//! satisfied or no more records are visible. Wakeups come from the
//! read-ahead worker, from segment-completion watches, and from a poll
//! backstop when neither applies.
//!
//! ## Cancellation
//!
//! If the oldest parked promise has been dropped by its consumer, the
//! reader no longer knows what was actually consumed; that is fatal, and
//! every remaining promise fails with a read error.
//!
//! ## Idle detection
//!
//! Crossing the warn threshold logs the read-ahead state and forces the
//! next read to bypass the cache; crossing the error threshold fails the
//! reader with an idle error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use streamlog_core::{Position, PositionedRecord};
use streamlog_metadata::SegmentMetadataStore;

use crate::cache::EntryCache;
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::handle_cache::HandleCache;
use crate::readahead::ReadAheadWorker;
use crate::segment::reader::SegmentRecordReader;

/// Continuous in-order reader over the stream's segments.
pub(crate) struct ContinuousLogReader {
    stream_name: String,
    config: LogConfig,
    metadata_store: Arc<SegmentMetadataStore>,
    handle_cache: Arc<HandleCache>,
    cache: Arc<EntryCache>,
    notify: Arc<Notify>,
    current: Option<SegmentRecordReader>,
    readahead: Option<ReadAheadWorker>,
    next_position: Position,
    end_of_stream: bool,
    last_record_at: Instant,
    last_warn_at: Instant,
    reader_idle: bool,
    force_blocking: bool,
}

impl ContinuousLogReader {
    pub(crate) fn new(
        stream_name: String,
        config: LogConfig,
        metadata_store: Arc<SegmentMetadataStore>,
        handle_cache: Arc<HandleCache>,
        cache: Arc<EntryCache>,
        notify: Arc<Notify>,
        start: Position,
    ) -> Self {
        let next_position = if start == Position::INVALID {
            Position::INITIAL_LOWER_BOUND
        } else {
            start
        };
        Self {
            stream_name,
            config,
            metadata_store,
            handle_cache,
            cache,
            notify,
            current: None,
            readahead: None,
            next_position,
            end_of_stream: false,
            last_record_at: Instant::now(),
            last_warn_at: Instant::now(),
            reader_idle: false,
            force_blocking: false,
        }
    }

    /// Next record (control records included), or `None` when nothing more
    /// is visible right now.
    pub(crate) async fn read_next(&mut self, nonblocking: bool) -> Result<Option<PositionedRecord>> {
        if self.end_of_stream {
            return Err(Error::EndOfStream);
        }
        let blocking_pass = self.force_blocking;
        let mut record = None;
        let mut advanced_once = false;
        while !advanced_once {
            advanced_once = self.create_or_position_reader().await?;
            if let Some(reader) = &mut self.current {
                record = reader.read_record(nonblocking && !blocking_pass).await?;
                if record.is_some() {
                    break;
                }
                if self.handle_end_of_current_segment().await? {
                    break;
                }
            } else {
                debug!(
                    stream = %self.stream_name,
                    next_position = %self.next_position,
                    "no segment at the reader's position yet"
                );
                break;
            }
        }
        self.force_blocking = false;

        match &record {
            Some(rec) => {
                if rec.record.is_end_of_stream() {
                    info!(stream = %self.stream_name, "terminal record reached");
                    self.end_of_stream = true;
                    self.stop_tailing();
                    return Err(Error::EndOfStream);
                }
                self.next_position = rec.position.next_slot();
                self.last_record_at = Instant::now();
                self.last_warn_at = Instant::now();
                if self.reader_idle {
                    info!(stream = %self.stream_name, "reader resumed from idle state");
                    self.reader_idle = false;
                }
            }
            None => self.check_idle()?,
        }
        Ok(record)
    }

    fn check_idle(&mut self) -> Result<()> {
        let idle_ms = self.last_record_at.elapsed().as_millis() as u64;
        if idle_ms > self.config.reader_idle_error_ms {
            error!(stream = %self.stream_name, idle_ms, "reader idle beyond the error threshold");
            if let Some(worker) = &self.readahead {
                worker.dump_state(true);
            }
            return Err(Error::IdleReader(idle_ms));
        }
        if idle_ms > self.config.reader_idle_warn_ms
            && self.last_warn_at.elapsed().as_millis() as u64 > self.config.reader_idle_warn_ms
        {
            warn!(stream = %self.stream_name, idle_ms, "reader idle");
            if let Some(worker) = &self.readahead {
                worker.dump_state(false);
            }
            self.last_warn_at = Instant::now();
            self.reader_idle = true;
            self.force_blocking = true;
        }
        Ok(())
    }

    /// Open the next segment if none is open, or refresh the current one.
    /// Returns `true` when there was nothing to open.
    async fn create_or_position_reader(&mut self) -> Result<bool> {
        if let Some(reader) = &mut self.current {
            reader.resume().await?;
            return Ok(false);
        }

        let segments = self.metadata_store.list().await?;
        let target = self.next_position;
        let candidate = segments.into_iter().find(|segment| {
            if segment.segment_seq < target.segment_seq() {
                return false;
            }
            if segment.segment_seq > target.segment_seq() {
                return true;
            }
            segment.is_in_progress() || segment.last_position() >= target
        });
        let Some(metadata) = candidate else {
            return Ok(true);
        };
        if metadata.truncated {
            return Err(Error::AlreadyTruncated(target));
        }

        let fence = !metadata.is_in_progress();
        let handle = self.handle_cache.open(metadata.store_id, fence).await?;
        let reader = SegmentRecordReader::open(
            metadata.clone(),
            Arc::clone(&handle),
            Arc::clone(&self.cache),
            Arc::clone(&self.metadata_store),
            Arc::clone(&self.notify),
            target,
        )
        .await?;
        info!(
            stream = %self.stream_name,
            segment_seq = metadata.segment_seq,
            in_progress = metadata.is_in_progress(),
            "opened segment for reading"
        );
        if self.config.read_ahead_enabled {
            self.readahead = Some(ReadAheadWorker::start(
                handle,
                Arc::clone(&self.cache),
                Arc::clone(&self.notify),
                reader.next_entry_id(),
                self.config.read_ahead_batch_size,
                self.config.read_ahead_max_batch_size,
                Duration::from_millis(self.config.read_ahead_poll_ms.max(1)),
            ));
        }
        self.current = Some(reader);
        Ok(false)
    }

    /// Returns `true` when the caller should stop advancing for now.
    async fn handle_end_of_current_segment(&mut self) -> Result<bool> {
        let reader = self.current.as_mut().expect("no current segment");
        if reader.reached_end_of_segment() {
            self.next_position = Position::new(reader.segment_seq() + 1, 0, 0);
            debug!(
                stream = %self.stream_name,
                segment_seq = reader.segment_seq(),
                "segment drained, advancing"
            );
            self.stop_tailing();
            self.current = None;
            Ok(false)
        } else {
            reader.require_resume();
            Ok(true)
        }
    }

    fn stop_tailing(&mut self) {
        if let Some(worker) = self.readahead.take() {
            worker.stop();
        }
    }

    pub(crate) fn close(&mut self) {
        self.stop_tailing();
        self.current = None;
    }
}

enum PendingRead {
    Single(oneshot::Sender<Result<PositionedRecord>>),
    Bulk {
        count: usize,
        tx: oneshot::Sender<Result<Vec<PositionedRecord>>>,
    },
}

impl PendingRead {
    fn is_cancelled(&self) -> bool {
        match self {
            PendingRead::Single(tx) => tx.is_closed(),
            PendingRead::Bulk { tx, .. } => tx.is_closed(),
        }
    }

    fn fail(self, error: &Error) {
        match self {
            PendingRead::Single(tx) => {
                let _ = tx.send(Err(error.clone()));
            }
            PendingRead::Bulk { tx, .. } => {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

struct ReaderShared {
    continuous: tokio::sync::Mutex<ContinuousLogReader>,
    pending: Mutex<VecDeque<PendingRead>>,
    schedule_count: AtomicU64,
    last_error: Mutex<Option<Error>>,
    notify: Arc<Notify>,
    closed: AtomicBool,
    nonblocking: bool,
    poll_interval: Duration,
}

impl ReaderShared {
    fn schedule(self: &Arc<Self>) {
        if self.schedule_count.fetch_add(1, Ordering::SeqCst) == 0 {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                background_read(shared).await;
            });
        }
    }

    fn set_sticky_error(&self, error: &Error) {
        self.last_error.lock().unwrap().get_or_insert(error.clone());
    }

    fn fail_all_pending(&self, error: &Error) {
        let drained: Vec<PendingRead> = self.pending.lock().unwrap().drain(..).collect();
        for pending in drained {
            pending.fail(error);
        }
        self.schedule_count.store(0, Ordering::SeqCst);
    }

    /// Poll backstop: when no watch or read-ahead wakeup is coming, try
    /// again after the poll interval.
    fn schedule_retry(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.pending.lock().unwrap().is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.poll_interval).await;
            shared.notify.notify_one();
        });
    }
}

/// Single-shot background task: advance the stream until all parked
/// promises are satisfied or nothing more is visible.
async fn background_read(shared: Arc<ReaderShared>) {
    let mut reader = shared.continuous.lock().await;
    let mut budget = shared.schedule_count.load(Ordering::SeqCst);
    loop {
        let front = {
            let queue = shared.pending.lock().unwrap();
            match queue.front() {
                None => {
                    shared.schedule_count.store(0, Ordering::SeqCst);
                    return;
                }
                Some(pending) => {
                    if pending.is_cancelled() {
                        None
                    } else {
                        Some(match pending {
                            PendingRead::Single(_) => None,
                            PendingRead::Bulk { count, .. } => Some(*count),
                        })
                    }
                }
            }
        };
        let Some(bulk) = front else {
            // The consumer abandoned the oldest read; what was consumed is
            // now unknown, so the reader gives up.
            let e = Error::ReadCancelled;
            warn!("oldest pending read cancelled, failing reader");
            shared.set_sticky_error(&e);
            shared.fail_all_pending(&e);
            return;
        };

        if let Some(e) = shared.last_error.lock().unwrap().clone() {
            shared.fail_all_pending(&e);
            return;
        }

        let outcome = match bulk {
            None => match read_skipping_controls(&mut reader, shared.nonblocking).await {
                Ok(Some(rec)) => {
                    if let Some(PendingRead::Single(tx)) =
                        shared.pending.lock().unwrap().pop_front()
                    {
                        let _ = tx.send(Ok(rec));
                    }
                    ReadOutcome::Progress
                }
                Ok(None) => ReadOutcome::Nothing,
                Err(e) => ReadOutcome::Failed(e),
            },
            Some(count) => {
                let mut batch = Vec::new();
                let mut failure = None;
                while batch.len() < count {
                    match read_skipping_controls(&mut reader, shared.nonblocking).await {
                        Ok(Some(rec)) => batch.push(rec),
                        Ok(None) => break,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                if !batch.is_empty() {
                    if let Some(PendingRead::Bulk { tx, .. }) =
                        shared.pending.lock().unwrap().pop_front()
                    {
                        let _ = tx.send(Ok(batch));
                    }
                    match failure {
                        // Delivered a partial batch; the error surfaces on
                        // the next read.
                        Some(e) => {
                            shared.set_sticky_error(&e);
                            ReadOutcome::Progress
                        }
                        None => ReadOutcome::Progress,
                    }
                } else if let Some(e) = failure {
                    ReadOutcome::Failed(e)
                } else {
                    ReadOutcome::Nothing
                }
            }
        };

        match outcome {
            ReadOutcome::Progress => {}
            ReadOutcome::Nothing => {
                if budget == 0 {
                    drop(reader);
                    shared.schedule_retry();
                    return;
                }
                // Saturating: a concurrent close may have zeroed the count.
                let prev = shared
                    .schedule_count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        Some(n.saturating_sub(1))
                    })
                    .unwrap_or(0);
                budget = prev.saturating_sub(1);
            }
            ReadOutcome::Failed(e) => {
                shared.set_sticky_error(&e);
                shared.fail_all_pending(&e);
                return;
            }
        }
    }
}

enum ReadOutcome {
    Progress,
    Nothing,
    Failed(Error),
}

async fn read_skipping_controls(
    reader: &mut ContinuousLogReader,
    nonblocking: bool,
) -> Result<Option<PositionedRecord>> {
    loop {
        match reader.read_next(nonblocking).await? {
            Some(rec) if rec.record.is_control() => continue,
            other => return Ok(other),
        }
    }
}

/// User-facing async reader handle; see the module docs.
pub struct LogReader {
    shared: Arc<ReaderShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LogReader {
    pub(crate) fn open(
        stream_name: String,
        config: LogConfig,
        metadata_store: Arc<SegmentMetadataStore>,
        handle_cache: Arc<HandleCache>,
        start: Position,
    ) -> LogReader {
        let notify = Arc::new(Notify::new());
        let cache = Arc::new(EntryCache::new(config.entry_cache_capacity));
        let nonblocking = config.read_ahead_enabled;
        let poll_interval = Duration::from_millis(config.read_ahead_poll_ms.max(1));
        let continuous = ContinuousLogReader::new(
            stream_name,
            config,
            metadata_store,
            handle_cache,
            cache,
            Arc::clone(&notify),
            start,
        );
        let shared = Arc::new(ReaderShared {
            continuous: tokio::sync::Mutex::new(continuous),
            pending: Mutex::new(VecDeque::new()),
            schedule_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            notify: Arc::clone(&notify),
            closed: AtomicBool::new(false),
            nonblocking,
            poll_interval,
        });

        // Translate read-ahead and watch wakeups into background reads.
        let notifier = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    shared.notify.notified().await;
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if !shared.pending.lock().unwrap().is_empty() {
                        shared.schedule();
                    }
                }
            })
        };

        LogReader {
            shared,
            tasks: Mutex::new(vec![notifier]),
        }
    }

    /// Next user record in position order. Cancelling the returned future
    /// (dropping it) is fatal for the reader.
    pub async fn read_next(&self) -> Result<PositionedRecord> {
        let rx = {
            if let Some(e) = self.shared.last_error.lock().unwrap().clone() {
                return Err(e);
            }
            let (tx, rx) = oneshot::channel();
            let was_empty = {
                let mut queue = self.shared.pending.lock().unwrap();
                let was_empty = queue.is_empty();
                queue.push_back(PendingRead::Single(tx));
                was_empty
            };
            if was_empty {
                self.shared.schedule();
            }
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadCancelled),
        }
    }

    /// Up to `count` records. Returns as soon as at least one record is
    /// available; stops early at the visible tail or at end of stream.
    pub async fn read_bulk(&self, count: usize) -> Result<Vec<PositionedRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let rx = {
            if let Some(e) = self.shared.last_error.lock().unwrap().clone() {
                return Err(e);
            }
            let (tx, rx) = oneshot::channel();
            let was_empty = {
                let mut queue = self.shared.pending.lock().unwrap();
                let was_empty = queue.is_empty();
                queue.push_back(PendingRead::Bulk { count, tx });
                was_empty
            };
            if was_empty {
                self.shared.schedule();
            }
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadCancelled),
        }
    }

    /// Fail pending reads, stop background work, and release watches.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.set_sticky_error(&Error::AlreadyClosed);
        self.shared.fail_all_pending(&Error::AlreadyClosed);
        self.shared.notify.notify_one();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut reader = self.shared.continuous.lock().await;
        reader.close();
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
