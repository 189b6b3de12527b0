//! Log Records
//!
//! A record is the unit of data appended to a stream. Each record carries:
//!
//! - **txid**: a non-negative, caller-assigned transaction id that must be
//!   monotonically non-decreasing along the stream
//! - **payload**: opaque bytes
//! - **flags**: control / end-of-stream markers
//!
//! Control records are synthesized by the writer to advance the entry
//! store's visible last-confirmed boundary; readers skip them. The
//! end-of-stream marker is a reserved record with `txid = MAX_TXID` that
//! permanently closes the stream.
//!
//! Payloads are `bytes::Bytes` so that slicing records out of a fetched
//! entry never copies.

use bytes::Bytes;

use crate::position::Position;
use crate::MAX_TXID;

/// Flag bit marking a control record.
pub const FLAG_CONTROL: u64 = 0x1;

/// Flag bit marking the end-of-stream record.
pub const FLAG_END_OF_STREAM: u64 = 0x2;

/// Payload of synthesized control records.
pub(crate) const CONTROL_PAYLOAD: &[u8] = b"control";

/// Payload of the end-of-stream marker.
pub(crate) const END_OF_STREAM_PAYLOAD: &[u8] = b"endOfStream";

/// A single record in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    flags: u64,
    txid: i64,
    payload: Bytes,
}

impl Record {
    pub fn new(txid: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: 0,
            txid,
            payload: payload.into(),
        }
    }

    /// Construct from raw parts, as read off the wire.
    pub fn from_parts(flags: u64, txid: i64, payload: Bytes) -> Self {
        Self {
            flags,
            txid,
            payload,
        }
    }

    /// A control record stamped with the last observed transaction id.
    pub fn control(txid: i64) -> Self {
        let mut record = Record::new(txid, Bytes::from_static(CONTROL_PAYLOAD));
        record.set_control();
        record
    }

    /// The reserved record that permanently closes a stream.
    pub fn end_of_stream_marker() -> Self {
        let mut record = Record::new(MAX_TXID, Bytes::from_static(END_OF_STREAM_PAYLOAD));
        record.flags |= FLAG_END_OF_STREAM;
        record
    }

    pub fn txid(&self) -> i64 {
        self.txid
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn set_control(&mut self) {
        self.flags |= FLAG_CONTROL;
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }

    /// Serialized size: flags + txid + payload length prefix + payload.
    pub fn persistent_size(&self) -> usize {
        8 + 8 + 4 + self.payload.len()
    }
}

/// A record paired with the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedRecord {
    pub record: Record,
    pub position: Position,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------

    #[test]
    fn test_new_record() {
        let rec = Record::new(42, Bytes::from("hello"));
        assert_eq!(rec.txid(), 42);
        assert_eq!(rec.payload(), &Bytes::from("hello"));
        assert_eq!(rec.flags(), 0);
        assert!(!rec.is_control());
        assert!(!rec.is_end_of_stream());
    }

    #[test]
    fn test_new_from_static_str() {
        let rec = Record::new(1, "payload".as_bytes().to_vec());
        assert_eq!(rec.payload().as_ref(), b"payload");
    }

    #[test]
    fn test_from_parts() {
        let rec = Record::from_parts(FLAG_CONTROL, 7, Bytes::from("x"));
        assert!(rec.is_control());
        assert_eq!(rec.txid(), 7);
    }

    // ---------------------------------------------------------------
    // Flags
    // ---------------------------------------------------------------

    #[test]
    fn test_set_control() {
        let mut rec = Record::new(1, Bytes::from("x"));
        rec.set_control();
        assert!(rec.is_control());
        assert!(!rec.is_end_of_stream());
    }

    #[test]
    fn test_control_constructor() {
        let rec = Record::control(99);
        assert!(rec.is_control());
        assert_eq!(rec.txid(), 99);
        assert_eq!(rec.payload().as_ref(), b"control");
    }

    #[test]
    fn test_end_of_stream_marker() {
        let rec = Record::end_of_stream_marker();
        assert!(rec.is_end_of_stream());
        assert!(!rec.is_control());
        assert_eq!(rec.txid(), MAX_TXID);
        assert_eq!(rec.payload().as_ref(), b"endOfStream");
    }

    #[test]
    fn test_flags_are_independent_bits() {
        let mut rec = Record::end_of_stream_marker();
        rec.set_control();
        assert!(rec.is_control());
        assert!(rec.is_end_of_stream());
    }

    // ---------------------------------------------------------------
    // Persistent size
    // ---------------------------------------------------------------

    #[test]
    fn test_persistent_size_empty_payload() {
        let rec = Record::new(1, Bytes::new());
        assert_eq!(rec.persistent_size(), 20);
    }

    #[test]
    fn test_persistent_size_counts_payload() {
        let rec = Record::new(1, Bytes::from(vec![0u8; 100]));
        assert_eq!(rec.persistent_size(), 120);
    }
}
