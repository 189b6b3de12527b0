//! StreamLog Storage Layer
//!
//! The write and read paths of the durable, strictly-ordered log stream.
//!
//! ## Write path
//!
//! ```text
//! LogWriter.write(record)
//!     |  ordered per-stream op queue (single consumer)
//!     v
//! SegmentWriter            <- packs records into transmission units
//!     |  one in-flight append at a time
//!     v
//! Entry store              <- replicated backend (trait)
//!     |  acknowledgement
//!     v
//! Position (segment_seq, entry_id, slot_id) resolved per record
//! ```
//!
//! Rolling completes the current segment, opens the next one, and drains
//! writes that queued up during the transition - all in arrival order.
//!
//! ## Read path
//!
//! ```text
//! LogReader.read_next()
//!     |  pending-promise FIFO + single-shot background task
//!     v
//! ContinuousLogReader      <- opens segments in order, idle detection
//!     v
//! SegmentRecordReader      <- entry iteration, resume, completion watch
//!     ^
//! ReadAheadWorker          <- tails last-confirmed into the entry cache
//! ```
//!
//! Readers deliver user records in strictly increasing position order,
//! skip control records, and surface the end-of-stream marker as a
//! terminal error.
//!
//! ## Main components
//!
//! - [`LogManager`]: process-wide shared resources and stream open/create
//! - [`LogWriter`] / [`SegmentWriter`]: the write path
//! - [`LogReader`]: the async read pipeline
//! - [`EntryStore`] / [`SegmentHandle`]: the backend contract, with
//!   [`MemEntryStore`] as the in-memory implementation
//! - [`StatusCode`]: translation of the error taxonomy to front-end codes

pub mod cache;
pub mod config;
pub mod entrystore;
pub mod error;
pub mod handle_cache;
pub mod manager;
pub mod readahead;
pub mod reader;
pub mod segment;
pub mod status;
pub mod writer;

pub use cache::EntryCache;
pub use config::LogConfig;
pub use entrystore::{Entry, EntryStore, MemEntryStore, SegmentHandle, StoreError};
pub use error::{Error, Result};
pub use handle_cache::HandleCache;
pub use manager::LogManager;
pub use readahead::ReadAheadWorker;
pub use reader::LogReader;
pub use segment::{PendingWrite, SegmentRecordReader, SegmentWriter};
pub use status::StatusCode;
pub use writer::LogWriter;
