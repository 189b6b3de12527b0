//! Entry Wire Codec
//!
//! Multiple complete records are packed into a single entry-store append
//! (one "transmission unit") before going over the network. Because every
//! record in an entry is complete, each entry can be decoded independently
//! of the rest of the segment.
//!
//! ## Record layout within an entry
//!
//! Records are concatenated with no framing:
//!
//! ```text
//! offset 0  : u64 big-endian flags
//! offset 8  : i64 big-endian txid
//! offset 16 : i32 big-endian payload_length (negative = corruption)
//! offset 20 : payload bytes
//! ```
//!
//! There is no record-level checksum; integrity is the entry store's
//! responsibility.
//!
//! `EntryWriter` builds the outgoing buffer. `EntryReader` walks a fetched
//! entry, stamping each record with its `(segment_seq, entry_id, slot_id)`
//! position, and can skip to a target position by scanning headers only -
//! payloads are never materialized while skipping.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::position::Position;
use crate::record::{PositionedRecord, Record};

/// Fixed per-record header size: flags + txid + payload length.
pub const RECORD_HEADER_SIZE: usize = 8 + 8 + 4;

/// Packs records into a transmission buffer.
#[derive(Debug)]
pub struct EntryWriter {
    buf: BytesMut,
}

impl EntryWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append one record to the buffer.
    pub fn write_record(&mut self, record: &Record) {
        self.buf.put_u64(record.flags());
        self.buf.put_i64(record.txid());
        self.buf.put_i32(record.payload().len() as i32);
        self.buf.put_slice(record.payload());
    }

    /// Bytes accumulated so far.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and hand off the finished buffer.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Iterates records out of one fetched entry, assigning slot positions.
#[derive(Debug)]
pub struct EntryReader {
    buf: Bytes,
    segment_seq: i64,
    entry_id: i64,
    next_slot: i64,
}

impl EntryReader {
    pub fn new(segment_seq: i64, entry_id: i64, payload: Bytes) -> Self {
        Self {
            buf: payload,
            segment_seq,
            entry_id,
            next_slot: 0,
        }
    }

    /// Position of the next record this reader would yield.
    pub fn current_position(&self) -> Position {
        Position::new(self.segment_seq, self.entry_id, self.next_slot)
    }

    /// Read the next record, or `None` at the end of the entry.
    ///
    /// A negative payload length or a short buffer is corruption and fails
    /// without consuming anything further.
    pub fn read_record(&mut self) -> Result<Option<PositionedRecord>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.remaining() < RECORD_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "truncated record header: {} bytes remaining",
                self.buf.remaining()
            )));
        }
        let flags = self.buf.get_u64();
        let txid = self.buf.get_i64();
        let length = self.buf.get_i32();
        if length < 0 {
            return Err(Error::Corrupt(format!("negative length {}", length)));
        }
        let length = length as usize;
        if self.buf.remaining() < length {
            return Err(Error::Corrupt(format!(
                "truncated payload: need {} bytes, {} remaining",
                length,
                self.buf.remaining()
            )));
        }
        let payload = self.buf.split_to(length);
        let position = self.current_position();
        self.next_slot += 1;
        Ok(Some(PositionedRecord {
            record: Record::from_parts(flags, txid, payload),
            position,
        }))
    }

    /// Advance until the next record's position is `>= target`, scanning
    /// headers only. Returns whether such a record exists in this entry.
    pub fn skip_to(&mut self, target: &Position) -> Result<bool> {
        loop {
            if self.current_position() >= *target {
                return Ok(!self.buf.is_empty());
            }
            if self.buf.is_empty() {
                return Ok(false);
            }
            if self.buf.remaining() < RECORD_HEADER_SIZE {
                return Err(Error::Corrupt(format!(
                    "truncated record header while skipping: {} bytes remaining",
                    self.buf.remaining()
                )));
            }
            self.buf.advance(16);
            let length = self.buf.get_i32();
            if length < 0 {
                return Err(Error::Corrupt(format!("negative length {}", length)));
            }
            let length = length as usize;
            if self.buf.remaining() < length {
                return Err(Error::Corrupt(format!(
                    "truncated payload while skipping: need {} bytes, {} remaining",
                    length,
                    self.buf.remaining()
                )));
            }
            self.buf.advance(length);
            self.next_slot += 1;
        }
    }
}
