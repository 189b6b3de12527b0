//! Status Code Translation
//!
//! The RPC front end speaks numeric status codes; the core speaks
//! `Error`. This module is the boundary between the two: a total mapping
//! from the internal error taxonomy to the wire-level codes the front end
//! returns to clients.

use streamlog_core::Error as CoreError;
use streamlog_metadata::MetadataError;

use crate::entrystore::StoreError;
use crate::error::Error;

/// Response codes returned by the front-end writer surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Success = 200,
    /// Stream owned elsewhere; header carries the owner's address.
    Found = 302,
    TooLargeRecord = 413,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    StreamUnavailable = 505,
    WriteException = 1001,
    TransmitError = 1002,
    FlushTimeout = 1003,
    EndOfStream = 1005,
    TransactionOutOfOrder = 1006,
    LockingException = 1008,
    InvalidStreamName = 1009,
    LogNotFound = 1010,
    IdleReader = 1011,
}

impl StatusCode {
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl From<&Error> for StatusCode {
    fn from(error: &Error) -> Self {
        match error {
            Error::EndOfStream => StatusCode::EndOfStream,
            Error::StreamNotReady => StatusCode::StreamUnavailable,
            Error::WriteCancelled | Error::ReadCancelled => StatusCode::WriteException,
            Error::FlushTimeout => StatusCode::FlushTimeout,
            Error::Transmit(StoreError::Fenced) => StatusCode::LockingException,
            Error::Transmit(_) => StatusCode::TransmitError,
            Error::IdleReader(_) => StatusCode::IdleReader,
            Error::AlreadyClosed => StatusCode::WriteException,
            Error::LogNotFound(_) => StatusCode::LogNotFound,
            Error::AlreadyTruncated(_) => StatusCode::WriteException,
            Error::Core(core) => match core {
                CoreError::RecordTooLarge { .. } => StatusCode::TooLargeRecord,
                CoreError::InvalidStreamName(_) => StatusCode::InvalidStreamName,
                CoreError::InvalidTxId(_) => StatusCode::TransactionOutOfOrder,
                _ => StatusCode::InternalServerError,
            },
            Error::Metadata(meta) => match meta {
                MetadataError::OwnershipAcquireFailed(_)
                | MetadataError::OwnershipLost(_)
                | MetadataError::LockNotHeld(_) => StatusCode::LockingException,
                MetadataError::SessionExpired => StatusCode::ServiceUnavailable,
                MetadataError::NodeNotFound(_) | MetadataError::NoSuchSegment(_) => {
                    StatusCode::LogNotFound
                }
                _ => StatusCode::InternalServerError,
            },
            Error::Store(StoreError::Fenced) => StatusCode::LockingException,
            Error::Store(store) if store.is_transient() => StatusCode::ServiceUnavailable,
            Error::Store(_) => StatusCode::TransmitError,
        }
    }
}
