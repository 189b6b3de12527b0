//! Per-segment write and read engines.
//!
//! `SegmentWriter` packs records into transmission units and drives them
//! through the entry store; `SegmentRecordReader` walks one segment's
//! entries back out, resuming across the in-progress tail.

pub mod reader;
pub mod writer;

pub use reader::SegmentRecordReader;
pub use writer::{PendingWrite, SegmentWriter};
