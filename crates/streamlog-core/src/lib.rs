//! StreamLog Core Types
//!
//! This crate defines the fundamental types shared by every layer of
//! StreamLog - the durable, strictly-ordered log stream:
//!
//! 1. **Position**: the `(segment_seq, entry_id, slot_id)` coordinate that
//!    uniquely identifies a record within a stream
//! 2. **Record**: the unit of data appended by writers and delivered to
//!    readers, carrying a transaction id and opaque payload
//! 3. **Entry codec**: the wire layout used to pack multiple records into a
//!    single entry-store append (a "transmission unit") and to iterate them
//!    back out
//!
//! ## Why a separate crate?
//!
//! The metadata layer, the storage layer, and tests all need these types
//! without pulling in the async machinery. Keeping them here mirrors the
//! split between stream coordinates and stream plumbing.

pub mod codec;
pub mod error;
pub mod position;
pub mod record;

pub use codec::{EntryReader, EntryWriter};
pub use error::{Error, Result};
pub use position::Position;
pub use record::{PositionedRecord, Record};

/// Largest valid transaction id. Reserved for the end-of-stream marker.
pub const MAX_TXID: i64 = i64::MAX;

/// Sentinel for "no transaction id observed yet".
pub const INVALID_TXID: i64 = -999;

/// Sentinel recorded for segments that were completed without any records.
pub const EMPTY_SEGMENT_TXID: i64 = -99;

/// Sequence number of the first segment in a stream.
pub const FIRST_SEGMENT_SEQNO: i64 = 1;

/// Sequence number of a segment that has not been assigned one yet.
pub const UNASSIGNED_SEGMENT_SEQNO: i64 = 0;

/// Maximum serialized size of a single record.
///
/// 8KB of headroom is reserved below the transmission limit so that a
/// maximum-size record plus entry metadata always fits in one transmission.
pub const MAX_RECORD_SIZE: usize = 1024 * 1024 - 8 * 1024;

/// Maximum size of one transmission unit (one entry-store append).
pub const MAX_TRANSMISSION_SIZE: usize = 1024 * 1024 - 4 * 1024;

/// Validate a user-supplied stream name.
///
/// Names starting with `.` are reserved for internal use and `/` would
/// collide with coordinator path separators.
pub fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidStreamName(name.to_string()));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidStreamName(name.to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidStreamName(name.to_string()));
    }
    Ok(())
}

/// Validate a transaction id supplied on a user write.
///
/// Negative ids are rejected and `MAX_TXID` is reserved for the
/// end-of-stream marker.
pub fn validate_user_txid(txid: i64) -> Result<()> {
    if txid < 0 || txid == MAX_TXID {
        return Err(Error::InvalidTxId(txid));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Stream name validation
    // ---------------------------------------------------------------

    #[test]
    fn test_valid_stream_names() {
        for name in ["orders", "click-stream", "a", "stream_2", "UPPER"] {
            assert!(validate_stream_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_empty_stream_name_rejected() {
        assert!(validate_stream_name("").is_err());
    }

    #[test]
    fn test_reserved_stream_name_rejected() {
        assert!(validate_stream_name(".internal").is_err());
        assert!(validate_stream_name(".").is_err());
    }

    #[test]
    fn test_slash_in_stream_name_rejected() {
        assert!(validate_stream_name("a/b").is_err());
        assert!(validate_stream_name("/lead").is_err());
        assert!(validate_stream_name("trail/").is_err());
    }

    // ---------------------------------------------------------------
    // Transaction id validation
    // ---------------------------------------------------------------

    #[test]
    fn test_valid_user_txids() {
        assert!(validate_user_txid(0).is_ok());
        assert!(validate_user_txid(1).is_ok());
        assert!(validate_user_txid(MAX_TXID - 1).is_ok());
    }

    #[test]
    fn test_negative_txid_rejected() {
        assert!(validate_user_txid(-1).is_err());
        assert!(validate_user_txid(INVALID_TXID).is_err());
    }

    #[test]
    fn test_max_txid_reserved() {
        assert!(validate_user_txid(MAX_TXID).is_err());
    }

    // ---------------------------------------------------------------
    // Limit relationships
    // ---------------------------------------------------------------

    #[test]
    fn test_record_limit_below_transmission_limit() {
        // A maximum-size record plus its header must fit in one transmission.
        assert!(MAX_RECORD_SIZE + 20 <= MAX_TRANSMISSION_SIZE);
    }
}
