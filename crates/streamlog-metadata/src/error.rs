//! Metadata Error Types
//!
//! Errors from coordinator operations, lock acquisition, and segment
//! metadata state transitions. All metadata operations return `Result<T>`
//! aliased to `Result<T, MetadataError>` for clean `?` propagation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Version conflict on node: {0}")]
    BadVersion(String),

    #[error("Coordinator session expired")]
    SessionExpired,

    #[error("Failed to acquire ownership of {0}")]
    OwnershipAcquireFailed(String),

    #[error("Lock released without matching acquire: {0}")]
    LockNotHeld(String),

    #[error("Lock ownership lost for {0}")]
    OwnershipLost(String),

    #[error("No such segment: {0}")]
    NoSuchSegment(i64),

    #[error("Segment already exists: {0}")]
    SegmentExists(i64),

    #[error("Segment {0} is already complete")]
    SegmentAlreadyComplete(i64),

    #[error(transparent)]
    Core(#[from] streamlog_core::Error),
}
