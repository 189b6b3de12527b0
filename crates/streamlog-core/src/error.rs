//! Core Error Types
//!
//! Errors that can surface from position decoding, record validation, and
//! the entry codec. Higher layers wrap these in their own error enums.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid position encoding: {0}")]
    InvalidPosition(String),

    #[error("Log record is corrupt: {0}")]
    Corrupt(String),

    #[error("Record of size {size} written when only {limit} is allowed")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("Invalid transaction id: {0}")]
    InvalidTxId(i64),

    #[error("Invalid stream name: {0}")]
    InvalidStreamName(String),

    #[error("Invalid segment metadata: {0}")]
    InvalidSegmentMetadata(String),
}
