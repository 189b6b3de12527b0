//! StreamLog Metadata Layer
//!
//! Everything that lives on the coordinator:
//!
//! 1. **Coordinator client** (`coordinator`): the trait the system is
//!    written against - hierarchical nodes, ephemeral semantics, one-shot
//!    delete watches, session expiry broadcast - plus an in-memory
//!    implementation with real multi-session behavior for tests and
//!    single-process use.
//! 2. **Distributed lock** (`lock`): the at-most-one-writer guarantee.
//!    Ephemeral sequential member nodes, predecessor watches, reentrant
//!    reason tags, expiry notification to dependents.
//! 3. **Segment metadata store** (`segments`): the stream's ordered
//!    segment list with strict in-progress -> complete transitions, the
//!    truncation marker, and the completion watches tailing readers rely
//!    on.
//!
//! The coordinator session is shared per process: one client serves every
//! stream's locks and metadata, and its expiry is broadcast to all of
//! them.

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod segments;

pub use coordinator::{
    Coordinator, CreateMode, MemCoordinator, MemCoordinatorServer, NodeData, SessionEvent,
};
pub use error::{MetadataError, Result};
pub use lock::DistributedLock;
pub use segments::{SegmentMetadata, SegmentMetadataStore, SegmentState};
