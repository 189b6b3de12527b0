//! Storage Error Types
//!
//! The write and read paths surface everything through this one enum.
//! Sticky errors (a writer or reader that has tripped once keeps failing
//! with the same cause) require `Clone`, so every variant is clonable.
//!
//! ## Error categories
//!
//! - **Transient**: `Transmit`, `Store` - the entry store rejected or lost
//!   an operation; retry belongs to the caller
//! - **Fencing / ownership**: `Metadata(OwnershipLost)` and
//!   `Transmit(Fenced)` - another owner took the stream
//! - **Terminal per-stream**: `EndOfStream`, `AlreadyTruncated`,
//!   `Core(InvalidStreamName)`, `Core(RecordTooLarge)`
//! - **Integrity**: `Core(Corrupt)` surfacing as a read failure with no
//!   partial consumption
//! - **Internal**: `WriteCancelled`, `ReadCancelled`, `AlreadyClosed`

use thiserror::Error;

use streamlog_core::Position;
use streamlog_metadata::MetadataError;

use crate::entrystore::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("End of stream reached")]
    EndOfStream,

    #[error("Stream is not ready: segment roll in progress")]
    StreamNotReady,

    #[error("Write cancelled")]
    WriteCancelled,

    #[error("Read cancelled")]
    ReadCancelled,

    #[error("Flush timed out")]
    FlushTimeout,

    #[error("Transmit failed: {0}")]
    Transmit(StoreError),

    #[error("Reader idle for {0} ms")]
    IdleReader(u64),

    #[error("Writer or reader already closed")]
    AlreadyClosed,

    #[error("Log not found: {0}")]
    LogNotFound(String),

    #[error("Position {0} is below the truncation point")]
    AlreadyTruncated(Position),

    #[error(transparent)]
    Core(streamlog_core::Error),

    #[error(transparent)]
    Metadata(MetadataError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<streamlog_core::Error> for Error {
    fn from(e: streamlog_core::Error) -> Self {
        Error::Core(e)
    }
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        Error::Metadata(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}
