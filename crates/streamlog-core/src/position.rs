//! Stream Positions
//!
//! A `Position` is the stream-unique coordinate of a record:
//!
//! - **segment_seq**: ordinal of the segment within the stream (1-based)
//! - **entry_id**: ordinal of the transmission unit within the segment,
//!   assigned by the entry store on append
//! - **slot_id**: zero-based offset of the record within the entry
//!
//! Positions order lexicographically on the three fields, which matches the
//! order records were appended in. Readers use positions to resume and
//! writers hand them back once an append is acknowledged.
//!
//! ## Serialization
//!
//! Two fixed-width byte layouts exist, both 25 bytes
//! (`version byte || 3 x i64 big-endian`):
//!
//! - version 0: the original layout, still accepted on decode
//! - version 1: the current layout written by default
//!
//! The byte form is base64-encoded when positions travel through
//! string-typed APIs. Decoding rejects unknown versions and wrong lengths.

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Version byte of the original serialization layout.
pub const VERSION0: u8 = 0;
/// Version byte of the current serialization layout.
pub const VERSION1: u8 = 1;

const CURRENT_VERSION: u8 = VERSION1;
const SERIALIZED_LEN: usize = 1 + 3 * 8;

/// Coordinate of a record within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    segment_seq: i64,
    entry_id: i64,
    slot_id: i64,
}

impl Position {
    /// Sentinel for "no position".
    pub const INVALID: Position = Position {
        segment_seq: 0,
        entry_id: -1,
        slot_id: -1,
    };

    /// First possible record position in a stream.
    pub const INITIAL: Position = Position {
        segment_seq: 1,
        entry_id: 0,
        slot_id: 0,
    };

    /// Non-inclusive lower bound: compares below every real record position.
    pub const INITIAL_LOWER_BOUND: Position = Position {
        segment_seq: 1,
        entry_id: 0,
        slot_id: -1,
    };

    pub fn new(segment_seq: i64, entry_id: i64, slot_id: i64) -> Self {
        Self {
            segment_seq,
            entry_id,
            slot_id,
        }
    }

    pub fn segment_seq(&self) -> i64 {
        self.segment_seq
    }

    pub fn entry_id(&self) -> i64 {
        self.entry_id
    }

    pub fn slot_id(&self) -> i64 {
        self.slot_id
    }

    /// A position strictly greater than this one. It may not correspond to
    /// an actual record; it is only used to position readers.
    pub fn next_slot(&self) -> Position {
        Position::new(self.segment_seq, self.entry_id, self.slot_id + 1)
    }

    /// The first position of the next segment. It may not correspond to an
    /// actual record; it is only used to position readers.
    pub fn next_segment(&self) -> Position {
        Position::new(self.segment_seq + 1, 0, 0)
    }

    /// Serialize with the current layout version.
    pub fn serialize_bytes(&self) -> Vec<u8> {
        self.serialize_bytes_version(CURRENT_VERSION)
            .expect("current version is always valid")
    }

    /// Serialize with an explicit layout version.
    pub fn serialize_bytes_version(&self, version: u8) -> Result<Vec<u8>> {
        if version > CURRENT_VERSION {
            return Err(Error::InvalidPosition(format!(
                "unknown serialization version {}",
                version
            )));
        }
        let mut buf = Vec::with_capacity(SERIALIZED_LEN);
        buf.put_u8(version);
        buf.put_i64(self.segment_seq);
        buf.put_i64(self.entry_id);
        buf.put_i64(self.slot_id);
        Ok(buf)
    }

    /// Base64 string form for string-typed APIs.
    pub fn serialize(&self) -> String {
        BASE64.encode(self.serialize_bytes())
    }

    /// Decode the base64 string form.
    pub fn deserialize(encoded: &str) -> Result<Position> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidPosition(format!("bad base64: {}", e)))?;
        Self::deserialize_bytes(&data)
    }

    /// Decode the byte form, accepting both layout versions.
    pub fn deserialize_bytes(data: &[u8]) -> Result<Position> {
        if data.is_empty() {
            return Err(Error::InvalidPosition("empty input".to_string()));
        }
        let mut buf = data;
        let version = buf.get_u8();
        match version {
            VERSION0 | VERSION1 => {
                if data.len() != SERIALIZED_LEN {
                    return Err(Error::InvalidPosition(format!(
                        "version {} position must be {} bytes, got {}",
                        version,
                        SERIALIZED_LEN,
                        data.len()
                    )));
                }
            }
            _ => {
                return Err(Error::InvalidPosition(format!(
                    "unknown version {}",
                    version
                )));
            }
        }
        Ok(Position::new(buf.get_i64(), buf.get_i64(), buf.get_i64()))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment_seq
            .cmp(&other.segment_seq)
            .then(self.entry_id.cmp(&other.entry_id))
            .then(self.slot_id.cmp(&other.slot_id))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.segment_seq, self.entry_id, self.slot_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Ordering
    // ---------------------------------------------------------------

    #[test]
    fn test_order_by_segment_seq_first() {
        assert!(Position::new(1, 100, 100) < Position::new(2, 0, 0));
    }

    #[test]
    fn test_order_by_entry_id_within_segment() {
        assert!(Position::new(3, 1, 100) < Position::new(3, 2, 0));
    }

    #[test]
    fn test_order_by_slot_id_within_entry() {
        assert!(Position::new(3, 7, 0) < Position::new(3, 7, 1));
    }

    #[test]
    fn test_order_equal() {
        assert_eq!(Position::new(3, 7, 2), Position::new(3, 7, 2));
    }

    #[test]
    fn test_invalid_sorts_below_initial() {
        assert!(Position::INVALID < Position::INITIAL);
    }

    #[test]
    fn test_lower_bound_sorts_below_initial() {
        assert!(Position::INITIAL_LOWER_BOUND < Position::INITIAL);
        assert!(Position::INVALID < Position::INITIAL_LOWER_BOUND);
    }

    // ---------------------------------------------------------------
    // Positioning helpers
    // ---------------------------------------------------------------

    #[test]
    fn test_next_slot() {
        let p = Position::new(2, 5, 3);
        assert_eq!(p.next_slot(), Position::new(2, 5, 4));
        assert!(p < p.next_slot());
    }

    #[test]
    fn test_next_segment() {
        let p = Position::new(2, 5, 3);
        assert_eq!(p.next_segment(), Position::new(3, 0, 0));
        assert!(p < p.next_segment());
    }

    // ---------------------------------------------------------------
    // Serialization round-trips
    // ---------------------------------------------------------------

    #[test]
    fn test_bytes_roundtrip_current_version() {
        let p = Position::new(42, 17, 3);
        let bytes = p.serialize_bytes();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[0], VERSION1);
        assert_eq!(Position::deserialize_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn test_bytes_roundtrip_version_zero() {
        let p = Position::new(7, 0, 0);
        let bytes = p.serialize_bytes_version(VERSION0).unwrap();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[0], VERSION0);
        assert_eq!(Position::deserialize_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn test_string_roundtrip() {
        let p = Position::new(9, 1234, 56);
        let s = p.serialize();
        assert_eq!(Position::deserialize(&s).unwrap(), p);
    }

    #[test]
    fn test_string_roundtrip_sentinels() {
        for p in [
            Position::INVALID,
            Position::INITIAL,
            Position::INITIAL_LOWER_BOUND,
        ] {
            assert_eq!(Position::deserialize(&p.serialize()).unwrap(), p);
        }
    }

    #[test]
    fn test_roundtrip_extreme_values() {
        let p = Position::new(i64::MAX, i64::MIN, -1);
        assert_eq!(
            Position::deserialize_bytes(&p.serialize_bytes()).unwrap(),
            p
        );
    }

    // ---------------------------------------------------------------
    // Decode rejections
    // ---------------------------------------------------------------

    #[test]
    fn test_deserialize_rejects_unknown_version() {
        let mut bytes = Position::new(1, 2, 3).serialize_bytes();
        bytes[0] = 9;
        assert!(Position::deserialize_bytes(&bytes).is_err());
    }

    #[test]
    fn test_deserialize_rejects_wrong_length() {
        let bytes = Position::new(1, 2, 3).serialize_bytes();
        assert!(Position::deserialize_bytes(&bytes[..24]).is_err());
        let mut long = bytes.clone();
        long.push(0);
        assert!(Position::deserialize_bytes(&long).is_err());
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        assert!(Position::deserialize_bytes(&[]).is_err());
    }

    #[test]
    fn test_deserialize_rejects_bad_base64() {
        assert!(Position::deserialize("not-base-64!!!").is_err());
    }

    #[test]
    fn test_serialize_rejects_future_version() {
        assert!(Position::new(1, 0, 0).serialize_bytes_version(2).is_err());
    }

    // ---------------------------------------------------------------
    // Display
    // ---------------------------------------------------------------

    #[test]
    fn test_display() {
        assert_eq!(Position::new(3, 7, 2).to_string(), "3:7:2");
        assert_eq!(Position::INVALID.to_string(), "0:-1:-1");
    }
}
