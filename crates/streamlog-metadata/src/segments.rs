//! Segment Metadata Store
//!
//! Tracks the ordered list of segments that make up a stream. Each segment
//! has one coordinator node holding a versioned binary blob of its
//! attributes. Lifecycle:
//!
//! 1. The lock holder creates an `inprogress_<seq>` node when it starts a
//!    segment.
//! 2. On roll or writer close the segment is completed: a
//!    `completed_<seq>` node is written with the observed tail
//!    (last entry / slot / txid) and the in-progress node is deleted.
//! 3. Deletion of the in-progress node is the completion signal readers
//!    watch for while tailing.
//!
//! Transitions are strictly in-progress -> complete; a completed segment is
//! never mutated except for the truncation marker.
//!
//! ## Blob layout
//!
//! One leading version byte, then fixed-width big-endian fields. Decoding
//! rejects unknown leading versions but tolerates unknown trailing bytes so
//! newer writers can append fields.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, info};

use streamlog_core::{Error as CoreError, Position, EMPTY_SEGMENT_TXID};

use crate::coordinator::{Coordinator, CreateMode};
use crate::error::{MetadataError, Result};

const BLOB_VERSION: u8 = 1;
const BLOB_MIN_LEN: usize = 1 + 7 * 8 + 2 * 4 + 2;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    InProgress,
    Complete,
}

/// Attributes of one segment, as stored on the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    /// Stream-unique, monotonically increasing ordinal.
    pub segment_seq: i64,
    /// Identifier of the backing entry-store segment.
    pub store_id: u64,
    /// Transaction id of the first record.
    pub start_txid: i64,
    /// Transaction id of the last record; `EMPTY_SEGMENT_TXID` if none.
    pub last_txid: i64,
    /// First entry ordinal (assigned by the entry store).
    pub first_entry_id: i64,
    /// Last entry ordinal; -1 while in progress.
    pub last_entry_id: i64,
    /// Slot of the last record within the last entry; -1 while in progress.
    pub last_slot_id: i64,
    /// Number of user records.
    pub record_count: u32,
    /// Opaque region tag owned by the writer's host environment.
    pub region_id: u32,
    pub state: SegmentState,
    /// Set once the segment falls wholly below a truncation point.
    pub truncated: bool,
}

impl SegmentMetadata {
    pub fn new_in_progress(segment_seq: i64, store_id: u64, start_txid: i64, region_id: u32) -> Self {
        Self {
            segment_seq,
            store_id,
            start_txid,
            last_txid: EMPTY_SEGMENT_TXID,
            first_entry_id: 0,
            last_entry_id: -1,
            last_slot_id: -1,
            record_count: 0,
            region_id,
            state: SegmentState::InProgress,
            truncated: false,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == SegmentState::InProgress
    }

    /// Position of the first possible record in this segment.
    pub fn first_position(&self) -> Position {
        Position::new(self.segment_seq, self.first_entry_id, 0)
    }

    /// Position of the last record; meaningful only once complete.
    pub fn last_position(&self) -> Position {
        Position::new(self.segment_seq, self.last_entry_id, self.last_slot_id)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOB_MIN_LEN);
        buf.put_u8(BLOB_VERSION);
        buf.put_i64(self.segment_seq);
        buf.put_u64(self.store_id);
        buf.put_i64(self.start_txid);
        buf.put_i64(self.last_txid);
        buf.put_i64(self.first_entry_id);
        buf.put_i64(self.last_entry_id);
        buf.put_i64(self.last_slot_id);
        buf.put_u32(self.record_count);
        buf.put_u32(self.region_id);
        buf.put_u8(match self.state {
            SegmentState::InProgress => 0,
            SegmentState::Complete => 1,
        });
        buf.put_u8(self.truncated as u8);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, CoreError> {
        if data.is_empty() {
            return Err(CoreError::InvalidSegmentMetadata("empty blob".to_string()));
        }
        let mut buf = data;
        let version = buf.get_u8();
        if version != BLOB_VERSION {
            return Err(CoreError::InvalidSegmentMetadata(format!(
                "unknown version {}",
                version
            )));
        }
        if data.len() < BLOB_MIN_LEN {
            return Err(CoreError::InvalidSegmentMetadata(format!(
                "blob too short: {} bytes",
                data.len()
            )));
        }
        let segment_seq = buf.get_i64();
        let store_id = buf.get_u64();
        let start_txid = buf.get_i64();
        let last_txid = buf.get_i64();
        let first_entry_id = buf.get_i64();
        let last_entry_id = buf.get_i64();
        let last_slot_id = buf.get_i64();
        let record_count = buf.get_u32();
        let region_id = buf.get_u32();
        let state = match buf.get_u8() {
            0 => SegmentState::InProgress,
            1 => SegmentState::Complete,
            other => {
                return Err(CoreError::InvalidSegmentMetadata(format!(
                    "unknown state {}",
                    other
                )));
            }
        };
        let truncated = buf.get_u8() != 0;
        // Trailing bytes from newer layouts are ignored.
        Ok(Self {
            segment_seq,
            store_id,
            start_txid,
            last_txid,
            first_entry_id,
            last_entry_id,
            last_slot_id,
            record_count,
            region_id,
            state,
            truncated,
        })
    }
}

fn inprogress_node(seq: i64) -> String {
    format!("inprogress_{:020}", seq)
}

fn completed_node(seq: i64) -> String {
    format!("completed_{:020}", seq)
}

/// Coordinator-backed store of a stream's segment list.
pub struct SegmentMetadataStore {
    coordinator: Arc<dyn Coordinator>,
    segments_path: String,
}

impl SegmentMetadataStore {
    /// `stream_path` is the stream's root node, e.g. `/streams/orders`.
    pub fn new(coordinator: Arc<dyn Coordinator>, stream_path: &str) -> Self {
        Self {
            coordinator,
            segments_path: format!("{}/segments", stream_path),
        }
    }

    /// Create the parent nodes for this stream if needed.
    pub async fn init(&self) -> Result<()> {
        let mut path = String::new();
        for part in self.segments_path.split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
            match self
                .coordinator
                .create(&path, Bytes::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(MetadataError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn node_path(&self, name: &str) -> String {
        format!("{}/{}", self.segments_path, name)
    }

    /// Register a new in-progress segment.
    pub async fn create_in_progress(
        &self,
        segment_seq: i64,
        store_id: u64,
        start_txid: i64,
        region_id: u32,
    ) -> Result<SegmentMetadata> {
        let metadata = SegmentMetadata::new_in_progress(segment_seq, store_id, start_txid, region_id);
        let path = self.node_path(&inprogress_node(segment_seq));
        match self
            .coordinator
            .create(&path, metadata.encode(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                info!(segment_seq, store_id, start_txid, "created in-progress segment");
                Ok(metadata)
            }
            Err(MetadataError::NodeExists(_)) => Err(MetadataError::SegmentExists(segment_seq)),
            Err(e) => Err(e),
        }
    }

    /// Transition a segment from in-progress to complete, recording the
    /// observed tail. Deleting the in-progress node signals completion to
    /// watchers.
    pub async fn complete(
        &self,
        segment_seq: i64,
        last_entry_id: i64,
        last_slot_id: i64,
        last_txid: i64,
        record_count: u32,
    ) -> Result<SegmentMetadata> {
        let inprogress_path = self.node_path(&inprogress_node(segment_seq));
        let node = self
            .coordinator
            .get(&inprogress_path)
            .await?
            .ok_or_else(|| {
                // No resurrection: completing twice is a caller bug.
                MetadataError::NoSuchSegment(segment_seq)
            })?;
        let mut metadata = SegmentMetadata::decode(&node.data)?;
        metadata.state = SegmentState::Complete;
        metadata.last_entry_id = last_entry_id;
        metadata.last_slot_id = last_slot_id;
        metadata.last_txid = last_txid;
        metadata.record_count = record_count;

        self.coordinator
            .create(
                &self.node_path(&completed_node(segment_seq)),
                metadata.encode(),
                CreateMode::Persistent,
            )
            .await?;
        self.coordinator.delete(&inprogress_path).await?;
        info!(
            segment_seq,
            last_entry_id, last_slot_id, last_txid, record_count, "segment completed"
        );
        Ok(metadata)
    }

    /// All segments of the stream, ordered by sequence number.
    pub async fn list(&self) -> Result<Vec<SegmentMetadata>> {
        let names = self.coordinator.children(&self.segments_path).await?;
        let mut segments = Vec::with_capacity(names.len());
        for name in names {
            let path = self.node_path(&name);
            if let Some(node) = self.coordinator.get(&path).await? {
                segments.push(SegmentMetadata::decode(&node.data)?);
            }
            // A node deleted between listing and reading was an
            // in-progress marker that just completed; its completed twin
            // is already in the listing or will be seen on the next list.
        }
        segments.sort_by_key(|s| (s.segment_seq, s.is_in_progress()));
        segments.dedup_by_key(|s| s.segment_seq);
        Ok(segments)
    }

    /// Highest segment sequence in use, or 0 if the stream has none.
    pub async fn max_segment_seq(&self) -> Result<i64> {
        Ok(self
            .list()
            .await?
            .last()
            .map(|s| s.segment_seq)
            .unwrap_or(streamlog_core::UNASSIGNED_SEGMENT_SEQNO))
    }

    /// Mark every completed segment lying wholly below `position` as
    /// truncated. Idempotent; returns whether anything changed.
    pub async fn mark_truncated_below(&self, position: Position) -> Result<bool> {
        if position == Position::INVALID {
            return Ok(false);
        }
        let mut changed = false;
        for segment in self.list().await? {
            if segment.is_in_progress()
                || segment.truncated
                || segment.segment_seq >= position.segment_seq()
            {
                continue;
            }
            let path = self.node_path(&completed_node(segment.segment_seq));
            if let Some(node) = self.coordinator.get(&path).await? {
                let mut updated = SegmentMetadata::decode(&node.data)?;
                updated.truncated = true;
                self.coordinator
                    .set(&path, updated.encode(), node.version)
                    .await?;
                debug!(segment_seq = segment.segment_seq, "segment marked truncated");
                changed = true;
            }
        }
        Ok(changed)
    }

    /// One-shot completion watch for an in-progress segment. Fires when
    /// the in-progress node is deleted; fires immediately if the segment
    /// is already complete.
    pub async fn watch_completion(&self, segment_seq: i64) -> Result<oneshot::Receiver<()>> {
        self.coordinator
            .watch_delete(&self.node_path(&inprogress_node(segment_seq)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemCoordinatorServer;

    async fn store() -> SegmentMetadataStore {
        let store = SegmentMetadataStore::new(MemCoordinatorServer::new().connect(), "/streams/s1");
        store.init().await.unwrap();
        store
    }

    // ---------------------------------------------------------------
    // Blob codec
    // ---------------------------------------------------------------

    #[test]
    fn test_blob_roundtrip_in_progress() {
        let m = SegmentMetadata::new_in_progress(3, 17, 100, 2);
        let decoded = SegmentMetadata::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);
        assert!(decoded.is_in_progress());
        assert_eq!(decoded.last_entry_id, -1);
        assert_eq!(decoded.last_txid, EMPTY_SEGMENT_TXID);
    }

    #[test]
    fn test_blob_roundtrip_complete() {
        let mut m = SegmentMetadata::new_in_progress(5, 9, 10, 0);
        m.state = SegmentState::Complete;
        m.last_entry_id = 41;
        m.last_slot_id = 3;
        m.last_txid = 999;
        m.record_count = 250;
        m.truncated = true;
        assert_eq!(SegmentMetadata::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn test_blob_tolerates_trailing_bytes() {
        let m = SegmentMetadata::new_in_progress(1, 1, 1, 0);
        let mut data = m.encode().to_vec();
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(SegmentMetadata::decode(&data).unwrap(), m);
    }

    #[test]
    fn test_blob_rejects_unknown_version() {
        let m = SegmentMetadata::new_in_progress(1, 1, 1, 0);
        let mut data = m.encode().to_vec();
        data[0] = 7;
        assert!(SegmentMetadata::decode(&data).is_err());
    }

    #[test]
    fn test_blob_rejects_truncation() {
        let m = SegmentMetadata::new_in_progress(1, 1, 1, 0);
        let data = m.encode();
        assert!(SegmentMetadata::decode(&data[..data.len() - 4]).is_err());
        assert!(SegmentMetadata::decode(&[]).is_err());
    }

    #[test]
    fn test_positions() {
        let mut m = SegmentMetadata::new_in_progress(4, 1, 1, 0);
        m.last_entry_id = 10;
        m.last_slot_id = 2;
        assert_eq!(m.first_position(), Position::new(4, 0, 0));
        assert_eq!(m.last_position(), Position::new(4, 10, 2));
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_create_list_complete() {
        let store = store().await;
        store.create_in_progress(1, 100, 1, 0).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_in_progress());

        let completed = store.complete(1, 9, 0, 10, 10).await.unwrap();
        assert_eq!(completed.last_entry_id, 9);
        assert_eq!(completed.last_txid, 10);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].is_in_progress());
        assert_eq!(listed[0].record_count, 10);
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let store = store().await;
        store.create_in_progress(2, 2, 20, 0).await.unwrap();
        store.complete(2, 5, 0, 29, 10).await.unwrap();
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        store.complete(1, 3, 1, 19, 8).await.unwrap();
        store.create_in_progress(3, 3, 30, 0).await.unwrap();

        let seqs: Vec<i64> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|s| s.segment_seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.max_segment_seq().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        assert!(matches!(
            store.create_in_progress(1, 2, 1, 0).await,
            Err(MetadataError::SegmentExists(1))
        ));
    }

    #[tokio::test]
    async fn test_complete_twice_fails() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        store.complete(1, 0, 0, 1, 1).await.unwrap();
        assert!(matches!(
            store.complete(1, 0, 0, 1, 1).await,
            Err(MetadataError::NoSuchSegment(1))
        ));
    }

    #[tokio::test]
    async fn test_max_seq_empty_stream() {
        let store = store().await;
        assert_eq!(store.max_segment_seq().await.unwrap(), 0);
    }

    // ---------------------------------------------------------------
    // Truncation
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_truncate_marks_whole_segments_below() {
        let store = store().await;
        for seq in 1..=3 {
            store.create_in_progress(seq, seq as u64, seq * 10, 0).await.unwrap();
            store.complete(seq, 4, 0, seq * 10 + 9, 5).await.unwrap();
        }
        store.create_in_progress(4, 4, 40, 0).await.unwrap();

        let changed = store
            .mark_truncated_below(Position::new(3, 2, 0))
            .await
            .unwrap();
        assert!(changed);

        let listed = store.list().await.unwrap();
        assert!(listed[0].truncated);
        assert!(listed[1].truncated);
        assert!(!listed[2].truncated, "segment at the position is kept");
        assert!(!listed[3].truncated, "in-progress segment is kept");
    }

    #[tokio::test]
    async fn test_truncate_is_idempotent() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        store.complete(1, 2, 0, 5, 3).await.unwrap();
        store.create_in_progress(2, 2, 6, 0).await.unwrap();

        let position = Position::new(2, 0, 0);
        assert!(store.mark_truncated_below(position).await.unwrap());
        let first = store.list().await.unwrap();
        assert!(!store.mark_truncated_below(position).await.unwrap());
        assert_eq!(store.list().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_truncate_invalid_position_is_noop() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        store.complete(1, 2, 0, 5, 3).await.unwrap();
        assert!(!store.mark_truncated_below(Position::INVALID).await.unwrap());
    }

    // ---------------------------------------------------------------
    // Completion watches
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_watch_fires_on_completion() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        let watch = store.watch_completion(1).await.unwrap();
        store.complete(1, 0, 0, 1, 1).await.unwrap();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_on_completed_segment_fires_immediately() {
        let store = store().await;
        store.create_in_progress(1, 1, 1, 0).await.unwrap();
        store.complete(1, 0, 0, 1, 1).await.unwrap();
        store.watch_completion(1).await.unwrap().await.unwrap();
    }
}
