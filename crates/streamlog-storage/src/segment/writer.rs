//! Segment Writer
//!
//! The per-segment packing engine. Records are buffered into a
//! transmission unit; a unit is sealed and handed to the entry store as
//! one append when the size policy fires, when a flush is requested, or
//! when the periodic flusher decides it is time. On acknowledgement every
//! record's completion channel resolves with its position
//! `(segment_seq, entry_id, slot)`.
//!
//! ## Transmission discipline
//!
//! At most one append is in flight at a time. Units sealed while an
//! append is pending queue behind it and dispatch in order as
//! acknowledgements return, so entry ids - and therefore positions - are
//! assigned in seal order. New writes keep accumulating into the next
//! unit the whole time.
//!
//! ## Error model
//!
//! The first non-OK acknowledgement is sticky: the writer flips to
//! errored, every queued and future operation fails with the same
//! transmit error, and only `close` / `abort` remain useful. Lock loss
//! reported by the distributed lock has the same effect.
//!
//! ## Control records
//!
//! The entry store advertises the previous entry, not the tail, while a
//! segment is open. After a successful data transmission the writer owes
//! readers a control record so the visible boundary advances; the
//! periodic flusher and the sync path both settle that debt.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use streamlog_core::{
    validate_user_txid, EntryWriter, Position, Record, MAX_RECORD_SIZE, MAX_TRANSMISSION_SIZE,
};
use streamlog_metadata::DistributedLock;

use crate::config::LogConfig;
use crate::entrystore::{SegmentHandle, StoreError};
use crate::error::{Error, Result};

pub(crate) const SEGMENT_WRITER_LOCK_REASON: &str = "segment-writer";

/// Completion channel for one accepted write. Resolves once the record's
/// transmission unit is acknowledged (or fails).
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<Position>>,
}

impl PendingWrite {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Position>>) -> Self {
        Self { rx }
    }

    /// An already-resolved write, used for fail-fast paths.
    pub(crate) fn ready(result: Result<Position>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the record's position.
    pub async fn position(self) -> Result<Position> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::WriteCancelled),
        }
    }
}

/// One buffered batch: the wire buffer plus the completion channels of
/// every record in it, in slot order. Ownership moves to the
/// acknowledgement task at dispatch.
struct TransmitUnit {
    buffer: EntryWriter,
    promises: Vec<oneshot::Sender<Result<Position>>>,
    control: bool,
    last_txid: i64,
}

impl TransmitUnit {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: EntryWriter::with_capacity(capacity),
            promises: Vec::new(),
            control: false,
            last_txid: streamlog_core::INVALID_TXID,
        }
    }

    fn fail(self, error: Error) {
        for promise in self.promises {
            let _ = promise.send(Err(error.clone()));
        }
    }
}

struct WriterInner {
    unit: TransmitUnit,
    /// Sealed units waiting for the in-flight append to return.
    outbox: VecDeque<TransmitUnit>,
    in_flight: bool,
    /// First failure; sticky.
    transmit_error: Option<StoreError>,
    last_txid: i64,
    last_txid_flushed: i64,
    last_txid_acknowledged: i64,
    /// Unsent user-record bytes in the active unit.
    outstanding_bytes: usize,
    /// A data transmission succeeded and no control record has advanced
    /// the visible boundary since.
    control_flush_needed: bool,
    should_flush_control: u32,
    pre_flush_counter: u32,
    stream_ended: bool,
    last_position: Position,
    record_count: u32,
    num_flushes: u64,
    num_data_bytes: u64,
}

/// State shared between the writer facade and acknowledgement tasks.
struct TransmitContext {
    segment_seq: i64,
    handle: Arc<dyn SegmentHandle>,
    inner: Mutex<WriterInner>,
    /// Count of sealed-but-unacknowledged units.
    outstanding: watch::Sender<usize>,
}

/// Send the next unit to the entry store and fan results back out.
fn dispatch(ctx: &Arc<TransmitContext>, unit: TransmitUnit) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let TransmitUnit {
            buffer,
            promises,
            control,
            last_txid,
        } = unit;
        let payload = buffer.finish();
        let size = payload.len();
        let result = ctx.handle.append(payload).await;

        let mut to_fail: Vec<TransmitUnit> = Vec::new();
        let mut next: Option<TransmitUnit> = None;
        let mut sticky: Option<StoreError> = None;
        {
            let mut inner = ctx.inner.lock().unwrap();
            inner.in_flight = false;
            match result {
                Ok(entry_id) => {
                    if let Some(err) = inner.transmit_error.clone() {
                        // Acknowledged after the writer already tripped.
                        for promise in promises {
                            let _ = promise.send(Err(Error::Transmit(err.clone())));
                        }
                    } else {
                        let slots = promises.len() as i64;
                        for (slot, promise) in promises.into_iter().enumerate() {
                            let _ = promise.send(Ok(Position::new(
                                ctx.segment_seq,
                                entry_id,
                                slot as i64,
                            )));
                        }
                        if last_txid > inner.last_txid_acknowledged {
                            inner.last_txid_acknowledged = last_txid;
                        }
                        if !control {
                            let unit_last = Position::new(ctx.segment_seq, entry_id, slots - 1);
                            if inner.last_position < unit_last {
                                inner.last_position = unit_last;
                            }
                            inner.control_flush_needed = true;
                        }
                        debug!(
                            segment_seq = ctx.segment_seq,
                            entry_id, slots, size, control, "transmit acknowledged"
                        );
                    }
                }
                Err(store_err) => {
                    error!(
                        segment_seq = ctx.segment_seq,
                        size,
                        error = %store_err,
                        "transmit failed"
                    );
                    let err = inner.transmit_error.get_or_insert(store_err).clone();
                    for promise in promises {
                        let _ = promise.send(Err(Error::Transmit(err.clone())));
                    }
                }
            }
            if let Some(err) = inner.transmit_error.clone() {
                sticky = Some(err);
                to_fail = inner.outbox.drain(..).collect();
            } else if let Some(unit) = inner.outbox.pop_front() {
                inner.in_flight = true;
                next = Some(unit);
            }
        }

        ctx.outstanding.send_modify(|n| *n -= 1);
        if !to_fail.is_empty() {
            let err = sticky.expect("sticky error set when failing the outbox");
            let drained = to_fail.len();
            for unit in to_fail {
                unit.fail(Error::Transmit(err.clone()));
            }
            ctx.outstanding.send_modify(|n| *n -= drained);
        }
        if let Some(unit) = next {
            dispatch(&ctx, unit);
        }
    });
}

/// Per-segment packing engine; see the module docs.
pub struct SegmentWriter {
    ctx: Arc<TransmitContext>,
    lock: Arc<DistributedLock>,
    start_txid: i64,
    transmission_threshold: usize,
    flush_timeout: Duration,
    close_retry_attempts: u32,
    close_retry_backoff: Duration,
    enforce_lock: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SegmentWriter {
    pub async fn new(
        config: &LogConfig,
        handle: Arc<dyn SegmentHandle>,
        lock: Arc<DistributedLock>,
        segment_seq: i64,
        start_txid: i64,
    ) -> Result<Arc<Self>> {
        lock.acquire(SEGMENT_WRITER_LOCK_REASON).await?;

        let transmission_threshold = if config.output_buffer_size > MAX_TRANSMISSION_SIZE {
            warn!(
                output_buffer_size = config.output_buffer_size,
                max = MAX_TRANSMISSION_SIZE,
                "output buffer size exceeds the transmission limit, clamping"
            );
            MAX_TRANSMISSION_SIZE
        } else {
            config.output_buffer_size
        };

        let (outstanding, _) = watch::channel(0usize);
        let inner = WriterInner {
            unit: TransmitUnit::new(transmission_threshold.max(1024)),
            outbox: VecDeque::new(),
            in_flight: false,
            transmit_error: None,
            last_txid: start_txid,
            last_txid_flushed: start_txid,
            last_txid_acknowledged: start_txid,
            outstanding_bytes: 0,
            control_flush_needed: false,
            should_flush_control: 0,
            pre_flush_counter: 0,
            stream_ended: false,
            last_position: Position::INVALID,
            record_count: 0,
            num_flushes: 0,
            num_data_bytes: 0,
        };
        let writer = Arc::new(Self {
            ctx: Arc::new(TransmitContext {
                segment_seq,
                handle,
                inner: Mutex::new(inner),
                outstanding,
            }),
            lock: Arc::clone(&lock),
            start_txid,
            transmission_threshold,
            flush_timeout: Duration::from_millis(config.flush_timeout_ms.max(1)),
            close_retry_attempts: config.close_retry_attempts.max(1),
            close_retry_backoff: Duration::from_millis(config.close_retry_backoff_ms.max(1)),
            enforce_lock: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if config.periodic_flush_ms > 0 {
            let period = Duration::from_millis((config.periodic_flush_ms / 2).max(1));
            let weak = Arc::downgrade(&writer);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(writer) = weak.upgrade() else { break };
                    writer.run_periodic_flush();
                }
            }));
        }
        {
            let weak = Arc::downgrade(&writer);
            let mut expiry = lock.expiry_watch();
            tasks.push(tokio::spawn(async move {
                if expiry.wait_for(|expired| *expired).await.is_ok() {
                    if let Some(writer) = weak.upgrade() {
                        writer.on_ownership_lost();
                    }
                }
            }));
        }
        *writer.tasks.lock().unwrap() = tasks;

        info!(segment_seq, start_txid, "segment writer opened");
        Ok(writer)
    }

    pub fn segment_seq(&self) -> i64 {
        self.ctx.segment_seq
    }

    pub fn start_txid(&self) -> i64 {
        self.start_txid
    }

    pub fn record_count(&self) -> u32 {
        self.ctx.inner.lock().unwrap().record_count
    }

    /// Data bytes accepted so far (transmitted plus buffered).
    pub fn written_bytes(&self) -> u64 {
        let inner = self.ctx.inner.lock().unwrap();
        inner.num_data_bytes + inner.outstanding_bytes as u64
    }

    pub fn last_txid(&self) -> i64 {
        self.ctx.inner.lock().unwrap().last_txid
    }

    pub fn last_acknowledged_txid(&self) -> i64 {
        self.ctx.inner.lock().unwrap().last_txid_acknowledged
    }

    /// Position of the last acknowledged data record.
    pub fn last_position(&self) -> Position {
        self.ctx.inner.lock().unwrap().last_position
    }

    pub fn is_errored(&self) -> bool {
        self.ctx.inner.lock().unwrap().transmit_error.is_some()
    }

    fn on_ownership_lost(&self) {
        warn!(segment_seq = self.ctx.segment_seq, "stream lock lost, writer errored");
        let mut inner = self.ctx.inner.lock().unwrap();
        inner.transmit_error.get_or_insert(StoreError::Fenced);
    }

    /// Accept one record. The buffer transmits when it crosses the
    /// configured threshold; otherwise the periodic flusher or an explicit
    /// flush sends it.
    pub fn write(&self, record: Record) -> Result<PendingWrite> {
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.stream_ended {
            return Err(Error::EndOfStream);
        }
        validate_user_txid(record.txid())?;
        let pending = self.write_record(&mut inner, record)?;
        inner.record_count += 1;
        if inner.outstanding_bytes > self.transmission_threshold {
            self.set_ready_to_flush_locked(&mut inner)?;
        }
        Ok(pending)
    }

    /// Accept one record and request transmission immediately.
    pub fn write_flush(&self, record: Record) -> Result<PendingWrite> {
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.stream_ended {
            return Err(Error::EndOfStream);
        }
        validate_user_txid(record.txid())?;
        let pending = self.write_record(&mut inner, record)?;
        inner.record_count += 1;
        self.set_ready_to_flush_locked(&mut inner)?;
        Ok(pending)
    }

    /// Sequential writes sharing a single trailing flush.
    pub fn write_bulk(&self, records: Vec<Record>) -> Result<Vec<PendingWrite>> {
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.stream_ended {
            return Err(Error::EndOfStream);
        }
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            validate_user_txid(record.txid())?;
            pending.push(self.write_record(&mut inner, record)?);
            inner.record_count += 1;
            if inner.outstanding_bytes > self.transmission_threshold {
                self.set_ready_to_flush_locked(&mut inner)?;
            }
        }
        self.set_ready_to_flush_locked(&mut inner)?;
        Ok(pending)
    }

    /// Buffer one record, transmitting first if it would overflow the
    /// unit. Control and terminal records come through here directly and
    /// skip user validation.
    fn write_record(&self, inner: &mut WriterInner, record: Record) -> Result<PendingWrite> {
        let size = record.persistent_size();
        if size > MAX_RECORD_SIZE {
            return Err(streamlog_core::Error::RecordTooLarge {
                size,
                limit: MAX_RECORD_SIZE,
            }
            .into());
        }
        if inner.unit.buffer.pending_bytes() + size > MAX_TRANSMISSION_SIZE {
            self.transmit_locked(inner, false)?;
        }
        let (tx, rx) = oneshot::channel();
        inner.unit.buffer.write_record(&record);
        inner.unit.promises.push(tx);
        if record.txid() < inner.last_txid {
            info!(
                last_txid = inner.last_txid,
                txid = record.txid(),
                "transaction id decreased"
            );
        }
        inner.unit.last_txid = record.txid();
        inner.last_txid = record.txid();
        if !record.is_control() {
            inner.outstanding_bytes += size;
        }
        Ok(PendingWrite::new(rx))
    }

    fn average_transmit_size(inner: &WriterInner) -> usize {
        if inner.num_flushes > 0 {
            (inner.num_data_bytes / inner.num_flushes) as usize
        } else {
            0
        }
    }

    /// Seal the active unit and queue it for dispatch. Returns whether
    /// anything was sealed.
    fn transmit_locked(&self, inner: &mut WriterInner, control: bool) -> Result<bool> {
        if self.enforce_lock.load(Ordering::SeqCst) {
            self.lock.check_ownership()?;
        }
        if let Some(err) = inner.transmit_error.clone() {
            return Err(Error::Transmit(err));
        }
        if inner.unit.buffer.is_empty() {
            return Ok(false);
        }
        let capacity = self
            .transmission_threshold
            .max(Self::average_transmit_size(inner))
            .max(1024);
        let mut unit = mem::replace(&mut inner.unit, TransmitUnit::new(capacity));
        unit.control = control;
        inner.last_txid_flushed = inner.last_txid;
        inner.outstanding_bytes = 0;
        if !control {
            inner.num_data_bytes += unit.buffer.pending_bytes() as u64;
            inner.num_flushes += 1;
        }
        inner.control_flush_needed = false;
        self.ctx.outstanding.send_modify(|n| *n += 1);
        if inner.in_flight {
            inner.outbox.push_back(unit);
        } else {
            inner.in_flight = true;
            dispatch(&self.ctx, unit);
        }
        Ok(true)
    }

    fn set_ready_to_flush_locked(&self, inner: &mut WriterInner) -> Result<i64> {
        if self.transmit_locked(inner, false)? {
            inner.should_flush_control += 1;
        }
        Ok(inner.last_txid_acknowledged)
    }

    /// Best-effort transmission of the active buffer.
    pub fn set_ready_to_flush(&self) -> Result<i64> {
        let mut inner = self.ctx.inner.lock().unwrap();
        self.set_ready_to_flush_locked(&mut inner)
    }

    async fn wait_for_outstanding(&self) -> Result<()> {
        if self.enforce_lock.load(Ordering::SeqCst) {
            self.lock.check_ownership()?;
        }
        let mut rx = self.ctx.outstanding.subscribe();
        match tokio::time::timeout(self.flush_timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(Error::AlreadyClosed),
            Err(_) => {
                let mut inner = self.ctx.inner.lock().unwrap();
                inner
                    .transmit_error
                    .get_or_insert(StoreError::Other("flush timed out".to_string()));
                return Err(Error::FlushTimeout);
            }
        }
        let inner = self.ctx.inner.lock().unwrap();
        if let Some(err) = inner.transmit_error.clone() {
            return Err(Error::Transmit(err));
        }
        Ok(())
    }

    /// Block until every outstanding transmission is acknowledged, then
    /// settle the control-record debt so readers can observe the advance.
    /// Returns the last acknowledged transaction id.
    pub async fn flush_and_sync(&self) -> Result<i64> {
        self.flush_phase_one().await?;
        self.flush_phase_two().await
    }

    async fn flush_phase_one(&self) -> Result<i64> {
        self.wait_for_outstanding().await?;

        let pre = {
            let mut inner = self.ctx.inner.lock().unwrap();
            let pre = inner.should_flush_control;
            inner.should_flush_control = 0;
            pre
        };
        if pre > 0 {
            let result: Result<()> = (|| {
                let mut inner = self.ctx.inner.lock().unwrap();
                let control = Record::control(inner.last_txid);
                let _ = self.write_record(&mut inner, control)?;
                self.transmit_locked(&mut inner, true)?;
                inner.pre_flush_counter = pre;
                Ok(())
            })();
            if let Err(e) = result {
                let mut inner = self.ctx.inner.lock().unwrap();
                inner.should_flush_control += pre;
                inner.pre_flush_counter = 0;
                return Err(e);
            }
        }
        Ok(self.ctx.inner.lock().unwrap().last_txid_acknowledged)
    }

    async fn flush_phase_two(&self) -> Result<i64> {
        let pre = self.ctx.inner.lock().unwrap().pre_flush_counter;
        if pre > 0 {
            let result = self.wait_for_outstanding().await;
            {
                let mut inner = self.ctx.inner.lock().unwrap();
                inner.pre_flush_counter = 0;
                if result.is_err() {
                    inner.should_flush_control += pre;
                }
            }
            result?;
        }
        Ok(self.ctx.inner.lock().unwrap().last_txid_acknowledged)
    }

    /// Write the reserved terminal record and flush. No appends are
    /// accepted afterwards.
    pub async fn mark_end_of_stream(&self) -> Result<i64> {
        {
            let mut inner = self.ctx.inner.lock().unwrap();
            if inner.stream_ended {
                return Ok(inner.last_txid_acknowledged);
            }
            let _ = self.write_record(&mut inner, Record::end_of_stream_marker())?;
            inner.stream_ended = true;
            self.set_ready_to_flush_locked(&mut inner)?;
        }
        self.flush_and_sync().await
    }

    fn run_periodic_flush(&self) {
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.transmit_error.is_some() {
            return;
        }
        let have_data = !inner.unit.buffer.is_empty();
        if !inner.control_flush_needed && !have_data {
            return;
        }
        let result: Result<()> = (|| {
            if !have_data {
                // Persisted data is waiting on a control record to become
                // visible to readers.
                let control = Record::control(inner.last_txid);
                let _ = self.write_record(&mut inner, control)?;
            }
            self.transmit_locked(&mut inner, !have_data)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(segment_seq = self.ctx.segment_seq, error = %e, "periodic flush failed");
        }
    }

    /// Flush (unless errored), cancel whatever remains, close the segment
    /// handle with bounded retries, and release the stream lock when
    /// `finalize` is set.
    pub async fn close(&self, finalize: bool) -> Result<()> {
        self.enforce_lock.store(finalize, Ordering::SeqCst);
        self.close_internal(true, finalize).await
    }

    /// Cancel pending work and release the lock without flushing.
    pub async fn abort(&self) -> Result<()> {
        self.close_internal(false, true).await
    }

    async fn close_internal(&self, attempt_flush: bool, release_lock: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The flusher must stop before the final flush.
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let mut flush_result = Ok(());
        if attempt_flush && !self.is_errored() {
            flush_result = async {
                self.set_ready_to_flush()?;
                self.flush_and_sync().await.map(|_| ())
            }
            .await;
        }

        // Anything still buffered or queued is cancelled.
        {
            let mut inner = self.ctx.inner.lock().unwrap();
            let unit = mem::replace(&mut inner.unit, TransmitUnit::new(1024));
            unit.fail(Error::WriteCancelled);
            let queued: Vec<TransmitUnit> = inner.outbox.drain(..).collect();
            let drained = queued.len();
            for unit in queued {
                unit.fail(Error::WriteCancelled);
            }
            if drained > 0 {
                self.ctx.outstanding.send_modify(|n| *n -= drained);
            }
        }

        let mut backoff = self.close_retry_backoff;
        for attempt in 1..=self.close_retry_attempts {
            match self.ctx.handle.close().await {
                Ok(()) | Err(StoreError::SegmentClosed) => break,
                Err(e) if e.is_transient() && attempt < self.close_retry_attempts => {
                    warn!(
                        segment_seq = self.ctx.segment_seq,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "segment handle close failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(segment_seq = self.ctx.segment_seq, error = %e, "segment handle close abandoned");
                    break;
                }
            }
        }

        if release_lock {
            let _ = self.lock.release(SEGMENT_WRITER_LOCK_REASON).await;
        }
        info!(segment_seq = self.ctx.segment_seq, finalize = release_lock, "segment writer closed");
        flush_result
    }
}
