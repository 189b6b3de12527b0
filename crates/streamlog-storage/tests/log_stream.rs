//! End-to-end scenarios over the full stack: log writer, segment
//! writer, metadata store, and the async read pipeline, all running
//! against the in-memory coordinator and entry store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use streamlog_core::{Position, Record};
use streamlog_metadata::{MemCoordinator, MemCoordinatorServer};
use streamlog_storage::{EntryStore, Error, LogConfig, LogManager, LogReader, MemEntryStore};

struct Cluster {
    server: Arc<MemCoordinatorServer>,
    store: Arc<MemEntryStore>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            server: MemCoordinatorServer::new(),
            store: MemEntryStore::new(),
        }
    }

    fn connect(&self) -> Arc<MemCoordinator> {
        self.server.connect()
    }

    fn manager(&self, config: LogConfig) -> (Arc<MemCoordinator>, Arc<LogManager>) {
        let client = self.connect();
        let entry_store = self.store.clone() as Arc<dyn EntryStore>;
        let manager = LogManager::new(client.clone(), entry_store, config);
        (client, manager)
    }
}

fn record(txid: i64, payload: String) -> Record {
    Record::new(txid, Bytes::from(payload))
}

async fn read_exactly(reader: &LogReader, count: usize) -> Vec<(Position, Record)> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let batch = reader.read_bulk(count - out.len()).await.unwrap();
        assert!(!batch.is_empty());
        for rec in batch {
            out.push((rec.position, rec.record));
        }
    }
    out
}

// -------------------------------------------------------------------
// Scenario: simple append and read across three segments
// -------------------------------------------------------------------

#[tokio::test]
async fn test_simple_append_and_read_across_segments() {
    let cluster = Cluster::new();
    let config = LogConfig {
        output_buffer_size: 1024,
        max_segment_records: 10,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("simple").await.unwrap();

    let mut positions = Vec::new();
    for i in 0..30i64 {
        let position = writer
            .write(record(i + 1, format!("record-{}", i)))
            .position()
            .await
            .unwrap();
        positions.push(position);
    }

    // One record per entry: each awaited write transmits on its own.
    for (i, position) in positions.iter().enumerate() {
        let i = i as i64;
        assert_eq!(position.segment_seq(), i / 10 + 1, "record {}", i);
        assert_eq!(position.entry_id(), i % 10, "record {}", i);
        assert_eq!(position.slot_id(), 0, "record {}", i);
    }
    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    assert_eq!(writer.last_txid(), 30);
    writer.close_and_complete().await.unwrap();

    // Three full segments; the last roll leaves a trailing empty segment
    // that close completes with no records.
    let segments = manager.list_segments("simple").await.unwrap();
    assert!(segments.len() >= 3);
    assert!(segments.iter().all(|s| !s.is_in_progress()));
    for segment in &segments[..3] {
        assert_eq!(segment.record_count, 10);
    }
    for segment in &segments[3..] {
        assert_eq!(segment.record_count, 0);
    }

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("simple", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let got = read_exactly(&reader, 30).await;
    for (i, (position, rec)) in got.iter().enumerate() {
        assert_eq!(position, &positions[i]);
        assert_eq!(rec.txid(), i as i64 + 1);
        assert_eq!(rec.payload().as_ref(), format!("record-{}", i).as_bytes());
    }
    reader.close().await;
}

// -------------------------------------------------------------------
// Scenario: pack multiple records per entry
// -------------------------------------------------------------------

#[tokio::test]
async fn test_bulk_write_packs_records_per_entry() {
    let cluster = Cluster::new();
    let config = LogConfig {
        output_buffer_size: 8 * 1024,
        segment_rolling_enabled: false,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("packed").await.unwrap();

    let records: Vec<Record> = (0..100i64)
        .map(|i| Record::new(i + 1, Bytes::from(vec![b'a' + (i % 26) as u8; 200])))
        .collect();
    let pending = writer.write_bulk(records.clone()).await.unwrap();

    let mut positions = Vec::new();
    for p in pending {
        positions.push(p.position().await.unwrap());
    }

    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    let entry_ids: Vec<i64> = positions.iter().map(|p| p.entry_id()).collect();
    assert!(entry_ids.windows(2).all(|w| w[0] <= w[1]));
    assert!(
        *entry_ids.last().unwrap() > 0,
        "8KB buffer must split 100 x 200B records into several entries"
    );

    // Sum of per-entry slot counts covers every record exactly once.
    let mut total = 0i64;
    for entry in entry_ids.iter().collect::<std::collections::BTreeSet<_>>() {
        let max_slot = positions
            .iter()
            .filter(|p| p.entry_id() == *entry)
            .map(|p| p.slot_id())
            .max()
            .unwrap();
        total += max_slot + 1;
    }
    assert_eq!(total, 100);

    writer.close_and_complete().await.unwrap();

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("packed", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let got = read_exactly(&reader, 100).await;
    for (i, (position, rec)) in got.iter().enumerate() {
        assert_eq!(position, &positions[i]);
        assert_eq!(rec.payload(), records[i].payload());
    }
    reader.close().await;
}

// -------------------------------------------------------------------
// Scenario: end-of-stream terminal
// -------------------------------------------------------------------

#[tokio::test]
async fn test_end_of_stream_terminates_writes_and_reads() {
    let cluster = Cluster::new();
    let config = LogConfig {
        segment_rolling_enabled: false,
        periodic_flush_ms: 50,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("terminal").await.unwrap();

    for i in 0..10i64 {
        writer
            .write(record(i + 1, format!("r{}", i)))
            .position()
            .await
            .unwrap();
    }
    writer.mark_end_of_stream().await.unwrap();

    let result = writer.write(record(11, "too-late".to_string())).position().await;
    assert!(matches!(result, Err(Error::EndOfStream)));

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("terminal", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let got = read_exactly(&reader, 10).await;
    assert_eq!(got.len(), 10);
    assert!(got.iter().zip(1..).all(|((_, r), txid)| r.txid() == txid));

    let result = tokio::time::timeout(Duration::from_secs(10), reader.read_next()).await;
    assert!(matches!(result, Ok(Err(Error::EndOfStream))));
    // The terminal error is sticky.
    assert!(matches!(reader.read_next().await, Err(Error::EndOfStream)));
    reader.close().await;
}

// -------------------------------------------------------------------
// Scenario: fencing between two writers
// -------------------------------------------------------------------

#[tokio::test]
async fn test_fencing_hands_stream_to_second_writer() {
    let cluster = Cluster::new();
    let config = LogConfig::default();

    let (client_a, manager_a) = cluster.manager(config.clone());
    let writer_a = manager_a.open_writer("fenced").await.unwrap();
    for i in 0..5i64 {
        writer_a
            .write(record(i + 1, format!("a-{}", i)))
            .position()
            .await
            .unwrap();
    }
    writer_a.flush().await.unwrap();

    // Writer A loses its coordinator session; B takes over and fences
    // A's in-progress segment during recovery.
    client_a.expire_session();
    let (_, manager_b) = cluster.manager(config.clone());
    let writer_b = manager_b.open_writer("fenced").await.unwrap();

    let result = writer_a.write(record(6, "a-late".to_string())).position().await;
    assert!(
        matches!(
            result,
            Err(Error::Transmit(_)) | Err(Error::Metadata(_)) | Err(Error::Store(_))
        ),
        "fenced writer must fail: {:?}",
        result.map(|p| p.to_string())
    );

    let mut b_positions = Vec::new();
    for i in 5..10i64 {
        b_positions.push(
            writer_b
                .write(record(i + 1, format!("b-{}", i)))
                .position()
                .await
                .unwrap(),
        );
    }
    writer_b.close_and_complete().await.unwrap();

    let segments = manager_b.list_segments("fenced").await.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[1].start_txid, 6);

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("fenced", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let got = read_exactly(&reader, 10).await;
    for (i, (position, rec)) in got.iter().enumerate() {
        assert_eq!(rec.txid(), i as i64 + 1);
        let expected_segment = if i < 5 { 1 } else { 2 };
        assert_eq!(position.segment_seq(), expected_segment, "record {}", i);
    }
    reader.close().await;
}

// -------------------------------------------------------------------
// Scenario: roll under load with pending drain
// -------------------------------------------------------------------

#[tokio::test]
async fn test_roll_under_load_drains_pending_writes() {
    let cluster = Cluster::new();
    let config = LogConfig {
        max_segment_records: 5,
        fail_fast_on_stream_not_ready: false,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("rolling").await.unwrap();

    // Submit everything up front without awaiting.
    let pending: Vec<_> = (0..20i64)
        .map(|i| writer.write(record(i + 1, format!("r{}", i))))
        .collect();

    let mut positions = Vec::new();
    for p in pending {
        positions.push(p.position().await.unwrap());
    }
    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1], "positions must be strictly increasing");
    }
    assert!(
        writer.pending_drain_count() >= 1,
        "writes submitted during the roll must have queued"
    );
    assert_eq!(writer.last_txid(), 20);

    writer.close_and_complete().await.unwrap();

    let segments = manager.list_segments("rolling").await.unwrap();
    assert!(segments.len() >= 2);
    // The roll was triggered by the record that completed segment 1.
    let trigger_txid = segments[0].last_txid;
    assert_eq!(segments[1].start_txid, trigger_txid);

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("rolling", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let got = read_exactly(&reader, 20).await;
    assert!(got.iter().zip(1..).all(|((_, r), txid)| r.txid() == txid));
    reader.close().await;
}

// -------------------------------------------------------------------
// Scenario: idle reader
// -------------------------------------------------------------------

#[tokio::test]
async fn test_idle_reader_fails_after_error_threshold() {
    let cluster = Cluster::new();
    let config = LogConfig {
        segment_rolling_enabled: false,
        periodic_flush_ms: 50,
        read_ahead_poll_ms: 20,
        reader_idle_warn_ms: 100,
        reader_idle_error_ms: 400,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("idle").await.unwrap();
    writer
        .write(record(1, "only".to_string()))
        .position()
        .await
        .unwrap();
    writer.flush().await.unwrap();

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("idle", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let first = reader.read_next().await.unwrap();
    assert_eq!(first.record.txid(), 1);

    // No new data arrives; the reader must give up past the error
    // threshold.
    let result = tokio::time::timeout(Duration::from_secs(30), reader.read_next()).await;
    assert!(
        matches!(result, Ok(Err(Error::IdleReader(_)))),
        "expected an idle-reader failure"
    );
    reader.close().await;
    writer.close_and_complete().await.unwrap();
}

// -------------------------------------------------------------------
// Oversize records leave the writer usable
// -------------------------------------------------------------------

#[tokio::test]
async fn test_oversize_record_rejected_then_writer_still_works() {
    let cluster = Cluster::new();
    let (_, manager) = cluster.manager(LogConfig::default());
    let writer = manager.open_writer("oversize").await.unwrap();

    let huge = Record::new(1, Bytes::from(vec![0u8; streamlog_core::MAX_RECORD_SIZE + 1]));
    let result = writer.write(huge).position().await;
    assert!(matches!(
        result,
        Err(Error::Core(streamlog_core::Error::RecordTooLarge { .. }))
    ));

    let position = writer
        .write(record(1, "fits".to_string()))
        .position()
        .await
        .unwrap();
    assert_eq!(position.slot_id(), 0);
    writer.close_and_complete().await.unwrap();
}

// -------------------------------------------------------------------
// Truncation is idempotent and visible to readers
// -------------------------------------------------------------------

#[tokio::test]
async fn test_truncation_idempotent_and_blocks_old_readers() {
    let cluster = Cluster::new();
    let config = LogConfig {
        max_segment_records: 5,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("truncated").await.unwrap();
    for i in 0..12i64 {
        writer
            .write(record(i + 1, format!("r{}", i)))
            .position()
            .await
            .unwrap();
    }

    let segments = manager.list_segments("truncated").await.unwrap();
    let cut = Position::new(segments[1].segment_seq, 0, 0);
    assert!(writer.truncate(cut).await.unwrap());
    let after_first = manager.list_segments("truncated").await.unwrap();
    // Applying the same truncation again changes nothing.
    assert!(!writer.truncate(cut).await.unwrap());
    assert_eq!(manager.list_segments("truncated").await.unwrap(), after_first);
    assert!(after_first[0].truncated);
    assert!(!after_first[1].truncated);

    // Truncating at the invalid position is a no-op.
    assert!(!writer.truncate(Position::INVALID).await.unwrap());

    writer.close_and_complete().await.unwrap();

    // A reader positioned below the truncation point fails.
    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("truncated", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), reader.read_next()).await;
    assert!(matches!(result, Ok(Err(Error::AlreadyTruncated(_)))));
    reader.close().await;
}

// -------------------------------------------------------------------
// Cancelling the oldest pending read is fatal
// -------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_read_future_fails_the_reader() {
    let cluster = Cluster::new();
    let config = LogConfig {
        read_ahead_poll_ms: 20,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("cancelled").await.unwrap();
    writer
        .write(record(1, "one".to_string()))
        .position()
        .await
        .unwrap();
    writer.flush().await.unwrap();

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("cancelled", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    reader.read_next().await.unwrap();

    // Abandon a read while it is parked waiting for data.
    let abandoned = tokio::time::timeout(Duration::from_millis(100), reader.read_next()).await;
    assert!(abandoned.is_err(), "no data should be available yet");

    // The reader no longer knows what was consumed.
    let result = tokio::time::timeout(Duration::from_secs(10), reader.read_next()).await;
    assert!(matches!(result, Ok(Err(Error::ReadCancelled))));
    reader.close().await;
    writer.close_and_complete().await.unwrap();
}

// -------------------------------------------------------------------
// Tailing: a reader sees records as flushes make them visible
// -------------------------------------------------------------------

#[tokio::test]
async fn test_tailing_reader_follows_live_writes() {
    let cluster = Cluster::new();
    let config = LogConfig {
        segment_rolling_enabled: false,
        periodic_flush_ms: 20,
        read_ahead_poll_ms: 10,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("tail").await.unwrap();
    writer
        .write(record(1, "seed".to_string()))
        .position()
        .await
        .unwrap();

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager
        .open_reader("tail", Position::INITIAL_LOWER_BOUND)
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), reader.read_next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.record.txid(), 1);

    // Publish more records while the reader is tailing.
    for i in 1..5i64 {
        writer
            .write(record(i + 1, format!("live-{}", i)))
            .position()
            .await
            .unwrap();
        let rec = tokio::time::timeout(Duration::from_secs(10), reader.read_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.record.txid(), i + 1);
        assert!(rec.position > first.position);
    }
    reader.close().await;
    writer.close_and_complete().await.unwrap();
}

// -------------------------------------------------------------------
// Reader resumes from a serialized position
// -------------------------------------------------------------------

#[tokio::test]
async fn test_reader_resumes_from_encoded_position() {
    let cluster = Cluster::new();
    let config = LogConfig {
        max_segment_records: 4,
        ..Default::default()
    };
    let (_, manager) = cluster.manager(config.clone());
    let writer = manager.open_writer("resume").await.unwrap();
    let mut positions = Vec::new();
    for i in 0..10i64 {
        positions.push(
            writer
                .write(record(i + 1, format!("r{}", i)))
                .position()
                .await
                .unwrap(),
        );
    }
    writer.close_and_complete().await.unwrap();

    // Carry the position through its string form, as a front end would.
    let encoded = positions[6].serialize();
    let resume_at = Position::deserialize(&encoded).unwrap();

    let (_, reader_manager) = cluster.manager(config);
    let reader = reader_manager.open_reader("resume", resume_at).await.unwrap();
    let got = read_exactly(&reader, 3).await;
    assert_eq!(got[0].0, positions[6]);
    assert_eq!(got[0].1.txid(), 7);
    assert_eq!(got[2].1.txid(), 9);
    reader.close().await;
}
