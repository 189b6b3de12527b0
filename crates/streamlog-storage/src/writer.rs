//! Log Writer
//!
//! Stream-level write orchestrator. All user-visible operations are
//! submitted onto one ordered, single-consumer queue per stream; the
//! consumer task executes them in arrival order, which is the load-bearing
//! ordering property of the whole write path. Per-record results travel
//! back on one-shot completion channels.
//!
//! ## Rolling
//!
//! When the rolling policy fires, the record that tripped it is written as
//! the last record of the current segment. Writes arriving while the roll
//! is pending queue up (or fail fast, if configured). Once the trigger
//! record is acknowledged the consumer completes the old segment's
//! metadata, opens `segment_seq + 1` in progress with the trigger's
//! transaction id as `start_txid`, and drains the queued writes into the
//! new segment in arrival order. If the trigger fails, every queued write
//! fails with the same cause and the writer goes into a terminal errored
//! state.
//!
//! ## Recovery
//!
//! Opening a writer acquires the stream lock for the writer's lifetime and
//! completes any segment a previous owner left in progress: the segment is
//! fenced at the entry store (cutting off the old writer), its tail is
//! scanned, and the completed metadata is written.

use std::mem;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use streamlog_core::{
    EntryReader, Position, Record, EMPTY_SEGMENT_TXID, INVALID_TXID, MAX_TXID,
};
use streamlog_metadata::{DistributedLock, SegmentMetadataStore};

use crate::config::LogConfig;
use crate::entrystore::{EntryStore, SegmentHandle};
use crate::error::{Error, Result};
use crate::segment::writer::{PendingWrite, SegmentWriter};

const LOG_WRITER_LOCK_REASON: &str = "log-writer";

type WriteReply = oneshot::Sender<Result<Position>>;

enum WriterOp {
    Write {
        record: Record,
        tx: WriteReply,
    },
    WriteBulk {
        records: Vec<Record>,
        tx: oneshot::Sender<Result<Vec<PendingWrite>>>,
    },
    Flush {
        tx: oneshot::Sender<Result<i64>>,
    },
    Truncate {
        position: Position,
        tx: oneshot::Sender<Result<bool>>,
    },
    MarkEndOfStream {
        tx: oneshot::Sender<Result<()>>,
    },
    Nop {
        tx: oneshot::Sender<()>,
    },
    /// Posted by the trigger record's forwarder once its write resolves.
    RollComplete {
        start_txid: i64,
    },
    RollFailed {
        error: Error,
    },
    Close {
        tx: oneshot::Sender<Result<()>>,
    },
}

/// Forward a segment-level completion to the caller, folding the
/// transaction id into the stream's last-txid bookkeeping on success.
fn spawn_forwarder(
    pending: PendingWrite,
    txid: i64,
    last_txid: Arc<AtomicI64>,
    tx: WriteReply,
) {
    tokio::spawn(async move {
        let result = pending.position().await;
        if result.is_ok() {
            last_txid.fetch_max(txid, Ordering::SeqCst);
        }
        let _ = tx.send(result);
    });
}

/// Like `spawn_forwarder`, but also reports the trigger record's outcome
/// back onto the op queue so the consumer can finish (or abort) the roll.
fn spawn_trigger_forwarder(
    pending: PendingWrite,
    txid: i64,
    last_txid: Arc<AtomicI64>,
    tx: WriteReply,
    op_tx: mpsc::UnboundedSender<WriterOp>,
) {
    tokio::spawn(async move {
        let result = pending.position().await;
        match &result {
            Ok(_) => {
                last_txid.fetch_max(txid, Ordering::SeqCst);
                let _ = op_tx.send(WriterOp::RollComplete { start_txid: txid });
            }
            Err(e) => {
                let _ = op_tx.send(WriterOp::RollFailed { error: e.clone() });
            }
        }
        let _ = tx.send(result);
    });
}

struct LogWriterCore {
    stream_name: String,
    config: LogConfig,
    entry_store: Arc<dyn EntryStore>,
    metadata: Arc<SegmentMetadataStore>,
    lock: Arc<DistributedLock>,
    op_tx: mpsc::UnboundedSender<WriterOp>,
    current: Option<Arc<SegmentWriter>>,
    segment_started_at: Instant,
    rolling: bool,
    pending: Vec<(Record, WriteReply)>,
    errored: Option<Error>,
    last_txid: Arc<AtomicI64>,
    pending_drained: Arc<AtomicU64>,
}

impl LogWriterCore {
    /// Returns `true` when the consumer loop should stop.
    async fn handle(&mut self, op: WriterOp) -> bool {
        match op {
            WriterOp::Write { record, tx } => {
                self.submit_record(record, tx, true).await;
            }
            WriterOp::WriteBulk { records, tx } => {
                let total = records.len();
                let mut out = Vec::with_capacity(total);
                for (index, record) in records.into_iter().enumerate() {
                    let (wtx, wrx) = oneshot::channel();
                    // Only the last record of the batch requests a flush.
                    self.submit_record(record, wtx, index + 1 == total).await;
                    out.push(PendingWrite::new(wrx));
                }
                let _ = tx.send(Ok(out));
            }
            WriterOp::Flush { tx } => {
                let _ = tx.send(self.flush().await);
            }
            WriterOp::Truncate { position, tx } => {
                let result = self
                    .metadata
                    .mark_truncated_below(position)
                    .await
                    .map_err(Error::from);
                let _ = tx.send(result);
            }
            WriterOp::MarkEndOfStream { tx } => {
                let _ = tx.send(self.mark_end_of_stream().await);
            }
            WriterOp::Nop { tx } => {
                let _ = tx.send(());
            }
            WriterOp::RollComplete { start_txid } => {
                self.finish_roll(start_txid).await;
            }
            WriterOp::RollFailed { error } => {
                self.error_out_pending_and_writer(error);
            }
            WriterOp::Close { tx } => {
                let _ = tx.send(self.close().await);
                return true;
            }
        }
        false
    }

    async fn submit_record(&mut self, record: Record, tx: WriteReply, flush: bool) {
        if let Some(e) = &self.errored {
            let _ = tx.send(Err(e.clone()));
            return;
        }
        if self.rolling {
            if self.config.fail_fast_on_stream_not_ready {
                let _ = tx.send(Err(Error::StreamNotReady));
            } else {
                self.pending.push((record, tx));
            }
            return;
        }
        let writer = match self.ensure_writer(record.txid()).await {
            Ok(writer) => writer,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let txid = record.txid();
        if self.should_roll(&writer) {
            // This record completes the current segment; queue everything
            // behind it until the roll is done.
            self.rolling = true;
            self.pending = Vec::new();
            debug!(stream = %self.stream_name, txid, "segment roll triggered");
            match writer.write_flush(record) {
                Ok(pending) => spawn_trigger_forwarder(
                    pending,
                    txid,
                    Arc::clone(&self.last_txid),
                    tx,
                    self.op_tx.clone(),
                ),
                Err(e) => {
                    let _ = tx.send(Err(e.clone()));
                    self.error_out_pending_and_writer(e);
                }
            }
            return;
        }
        let result = if flush {
            writer.write_flush(record)
        } else {
            writer.write(record)
        };
        match result {
            Ok(pending) => spawn_forwarder(pending, txid, Arc::clone(&self.last_txid), tx),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }

    fn should_roll(&self, writer: &SegmentWriter) -> bool {
        if !self.config.segment_rolling_enabled {
            return false;
        }
        let max_records = self.config.max_segment_records;
        if max_records > 0 && writer.record_count() + 1 >= max_records {
            return true;
        }
        let max_bytes = self.config.max_segment_bytes;
        if max_bytes > 0 && writer.written_bytes() >= max_bytes {
            return true;
        }
        let max_age = self.config.max_segment_age_ms;
        if max_age > 0 && self.segment_started_at.elapsed().as_millis() as u64 >= max_age {
            return true;
        }
        false
    }

    async fn ensure_writer(&mut self, start_txid: i64) -> Result<Arc<SegmentWriter>> {
        if let Some(writer) = &self.current {
            return Ok(Arc::clone(writer));
        }
        let segment_seq = self.metadata.max_segment_seq().await? + 1;
        self.open_segment(segment_seq, start_txid).await?;
        Ok(Arc::clone(self.current.as_ref().expect("segment just opened")))
    }

    async fn open_segment(&mut self, segment_seq: i64, start_txid: i64) -> Result<()> {
        let handle = self.entry_store.create_segment().await?;
        self.metadata
            .create_in_progress(segment_seq, handle.store_id(), start_txid, self.config.region_id)
            .await?;
        let writer = SegmentWriter::new(
            &self.config,
            handle,
            Arc::clone(&self.lock),
            segment_seq,
            start_txid,
        )
        .await?;
        info!(stream = %self.stream_name, segment_seq, start_txid, "opened segment for writing");
        self.current = Some(writer);
        self.segment_started_at = Instant::now();
        Ok(())
    }

    /// Complete the current segment's metadata from the writer's observed
    /// tail and close it. The stream lock stays held throughout: the
    /// segment writer's own hold is released, but the log writer's outer
    /// hold keeps the member node alive across rolls.
    async fn complete_current_segment(&mut self) -> Result<()> {
        let writer = self.current.take().expect("completing without a segment");
        let close_result = writer.close(true).await;
        let segment_seq = writer.segment_seq();
        let record_count = writer.record_count();
        let last_position = writer.last_position();
        let last_txid = if record_count == 0 {
            EMPTY_SEGMENT_TXID
        } else {
            writer.last_acknowledged_txid()
        };
        close_result?;
        self.metadata
            .complete(
                segment_seq,
                last_position.entry_id(),
                last_position.slot_id(),
                last_txid,
                record_count,
            )
            .await?;
        Ok(())
    }

    async fn finish_roll(&mut self, start_txid: i64) {
        let result: Result<()> = async {
            self.complete_current_segment().await?;
            let segment_seq = self.metadata.max_segment_seq().await? + 1;
            self.open_segment(segment_seq, start_txid).await
        }
        .await;

        match result {
            Ok(()) => {
                let writer = Arc::clone(self.current.as_ref().expect("roll opened a segment"));
                let drained = mem::take(&mut self.pending);
                self.rolling = false;
                self.pending_drained
                    .fetch_add(drained.len() as u64, Ordering::SeqCst);
                debug!(
                    stream = %self.stream_name,
                    count = drained.len(),
                    "dispatching writes queued during roll"
                );
                let mut iter = drained.into_iter();
                while let Some((record, tx)) = iter.next() {
                    let txid = record.txid();
                    match writer.write_flush(record) {
                        Ok(pending) => {
                            spawn_forwarder(pending, txid, Arc::clone(&self.last_txid), tx)
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.clone()));
                            for (_, tx) in iter {
                                let _ = tx.send(Err(Error::WriteCancelled));
                            }
                            self.errored = Some(e);
                            return;
                        }
                    }
                }
            }
            Err(e) => self.error_out_pending_and_writer(e),
        }
    }

    fn error_out_pending_and_writer(&mut self, error: Error) {
        warn!(stream = %self.stream_name, error = %error, "failing queued writes, writer errored");
        let pending = mem::take(&mut self.pending);
        self.rolling = false;
        self.errored = Some(error.clone());
        self.pending_drained
            .fetch_add(pending.len() as u64, Ordering::SeqCst);
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }

    async fn flush(&mut self) -> Result<i64> {
        if let Some(e) = &self.errored {
            return Err(e.clone());
        }
        match self.current.clone() {
            Some(writer) => {
                writer.set_ready_to_flush()?;
                writer.flush_and_sync().await
            }
            None => Ok(self.last_txid.load(Ordering::SeqCst)),
        }
    }

    async fn mark_end_of_stream(&mut self) -> Result<()> {
        if let Some(e) = &self.errored {
            return Err(e.clone());
        }
        if self.rolling {
            return Err(Error::StreamNotReady);
        }
        // MAX_TXID is only legal here: a terminal marker may open a
        // segment of its own on an empty stream.
        let writer = self.ensure_writer(MAX_TXID).await?;
        writer.mark_end_of_stream().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.rolling {
            let pending = mem::take(&mut self.pending);
            for (_, tx) in pending {
                let _ = tx.send(Err(Error::WriteCancelled));
            }
            self.rolling = false;
        }
        let mut result = Ok(());
        if self.current.is_some() {
            result = self.complete_current_segment().await;
        }
        if let Err(e) = self.lock.release(LOG_WRITER_LOCK_REASON).await {
            warn!(stream = %self.stream_name, error = %e, "stream lock release failed");
        }
        info!(stream = %self.stream_name, "log writer closed");
        result
    }
}

/// Scan a fenced segment to find its tail and user-record count.
async fn scan_segment_tail(
    handle: &Arc<dyn SegmentHandle>,
    segment_seq: i64,
    tail: i64,
) -> Result<(i64, i64, i64, u32)> {
    let entries = handle.read_entries(0, tail).await?;
    let mut last_entry = -1i64;
    let mut last_slot = -1i64;
    let mut last_txid = EMPTY_SEGMENT_TXID;
    let mut record_count = 0u32;
    for entry in entries {
        let mut reader = EntryReader::new(segment_seq, entry.entry_id, entry.payload);
        while let Some(rec) = reader.read_record()? {
            last_entry = rec.position.entry_id();
            last_slot = rec.position.slot_id();
            last_txid = rec.record.txid();
            if !rec.record.is_control() {
                record_count += 1;
            }
        }
    }
    Ok((last_entry, last_slot, last_txid, record_count))
}

/// Fence and complete segments a previous owner left in progress.
/// Returns the highest transaction id observed.
async fn recover_incomplete_segments(
    stream_name: &str,
    entry_store: &Arc<dyn EntryStore>,
    metadata: &Arc<SegmentMetadataStore>,
) -> Result<i64> {
    let mut recovered_txid = INVALID_TXID;
    for segment in metadata.list().await? {
        if !segment.is_in_progress() {
            recovered_txid = recovered_txid.max(segment.last_txid);
            continue;
        }
        let handle = entry_store.open_segment(segment.store_id, true).await?;
        let tail = handle.read_last_confirmed().await?;
        let (last_entry, last_slot, last_txid, record_count) = if tail < 0 {
            (-1, -1, EMPTY_SEGMENT_TXID, 0)
        } else {
            scan_segment_tail(&handle, segment.segment_seq, tail).await?
        };
        let _ = handle.close().await;
        metadata
            .complete(
                segment.segment_seq,
                last_entry,
                last_slot,
                last_txid,
                record_count,
            )
            .await?;
        info!(
            stream = %stream_name,
            segment_seq = segment.segment_seq,
            last_txid,
            record_count,
            "recovered in-progress segment"
        );
        recovered_txid = recovered_txid.max(last_txid);
    }
    Ok(recovered_txid)
}

/// Stream-level writer handle; see the module docs.
pub struct LogWriter {
    stream_name: String,
    op_tx: mpsc::UnboundedSender<WriterOp>,
    last_txid: Arc<AtomicI64>,
    pending_drained: Arc<AtomicU64>,
}

impl LogWriter {
    pub(crate) async fn open(
        stream_name: String,
        config: LogConfig,
        entry_store: Arc<dyn EntryStore>,
        metadata: Arc<SegmentMetadataStore>,
        lock: Arc<DistributedLock>,
    ) -> Result<LogWriter> {
        lock.acquire(LOG_WRITER_LOCK_REASON).await?;
        let recovered_txid =
            match recover_incomplete_segments(&stream_name, &entry_store, &metadata).await {
                Ok(txid) => txid,
                Err(e) => {
                    let _ = lock.release(LOG_WRITER_LOCK_REASON).await;
                    return Err(e);
                }
            };

        let (op_tx, mut op_rx) = mpsc::unbounded_channel();
        let last_txid = Arc::new(AtomicI64::new(recovered_txid));
        let pending_drained = Arc::new(AtomicU64::new(0));
        let mut core = LogWriterCore {
            stream_name: stream_name.clone(),
            config,
            entry_store,
            metadata,
            lock,
            op_tx: op_tx.clone(),
            current: None,
            segment_started_at: Instant::now(),
            rolling: false,
            pending: Vec::new(),
            errored: None,
            last_txid: Arc::clone(&last_txid),
            pending_drained: Arc::clone(&pending_drained),
        };
        tokio::spawn(async move {
            while let Some(op) = op_rx.recv().await {
                if core.handle(op).await {
                    break;
                }
            }
        });

        info!(stream = %stream_name, recovered_txid, "log writer opened");
        Ok(LogWriter {
            stream_name,
            op_tx,
            last_txid,
            pending_drained,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Submit one record; the returned future resolves with its position.
    /// Submission itself never blocks, so callers may pipeline writes.
    pub fn write(&self, record: Record) -> PendingWrite {
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(op)) =
            self.op_tx.send(WriterOp::Write { record, tx })
        {
            if let WriterOp::Write { tx, .. } = op {
                let _ = tx.send(Err(Error::AlreadyClosed));
            }
        }
        PendingWrite::new(rx)
    }

    /// Submit a batch as one ordered unit sharing a single trailing flush.
    pub async fn write_bulk(&self, records: Vec<Record>) -> Result<Vec<PendingWrite>> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::WriteBulk { records, tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Flush and wait for every outstanding transmission; returns the last
    /// acknowledged transaction id.
    pub async fn flush(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::Flush { tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Mark every segment wholly below `position` truncated. Idempotent.
    pub async fn truncate(&self, position: Position) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::Truncate { position, tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Write the terminal record; the stream accepts no appends after.
    pub async fn mark_end_of_stream(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::MarkEndOfStream { tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Queue barrier: resolves once every previously submitted operation
    /// has been dispatched.
    pub async fn nop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::Nop { tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)
    }

    /// Drain the queue, complete the current segment, and release the
    /// stream lock.
    pub async fn close_and_complete(&self) -> Result<()> {
        let _ = self.nop().await;
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(WriterOp::Close { tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Highest transaction id among successfully acknowledged writes.
    pub fn last_txid(&self) -> i64 {
        self.last_txid.load(Ordering::SeqCst)
    }

    /// Number of writes that were queued behind segment rolls.
    pub fn pending_drain_count(&self) -> u64 {
        self.pending_drained.load(Ordering::SeqCst)
    }
}
