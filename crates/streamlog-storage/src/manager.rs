//! Log Manager
//!
//! Process-wide front door. Holds the shared singletons - coordinator
//! client, entry store, segment handle cache, configuration - and opens
//! per-stream writers and readers against them. Everything is reference
//! counted through `Arc`, so the underlying sessions go away when the
//! last stream object does.
//!
//! Initialization order is coordinator, then entry store, then
//! per-stream objects; teardown happens in reverse as the `Arc`s unwind.

use std::sync::Arc;
use std::time::Duration;

use streamlog_core::{validate_stream_name, Position};
use streamlog_metadata::{Coordinator, DistributedLock, SegmentMetadataStore};

use crate::config::LogConfig;
use crate::entrystore::EntryStore;
use crate::error::{Error, Result};
use crate::handle_cache::HandleCache;
use crate::reader::LogReader;
use crate::writer::LogWriter;

const DEFAULT_NAMESPACE: &str = "/streams";

pub struct LogManager {
    coordinator: Arc<dyn Coordinator>,
    entry_store: Arc<dyn EntryStore>,
    handle_cache: Arc<HandleCache>,
    config: LogConfig,
    namespace: String,
    client_id: String,
}

impl LogManager {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        entry_store: Arc<dyn EntryStore>,
        config: LogConfig,
    ) -> Arc<Self> {
        let handle_cache = HandleCache::new(Arc::clone(&entry_store));
        Arc::new(Self {
            coordinator,
            entry_store,
            handle_cache,
            config,
            namespace: DEFAULT_NAMESPACE.to_string(),
            client_id: format!("streamlog-{}", std::process::id()),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn stream_path(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }

    fn metadata_store(&self, name: &str) -> Arc<SegmentMetadataStore> {
        Arc::new(SegmentMetadataStore::new(
            Arc::clone(&self.coordinator),
            &self.stream_path(name),
        ))
    }

    /// Create the stream's coordinator layout. Idempotent.
    pub async fn create_stream(&self, name: &str) -> Result<()> {
        validate_stream_name(name)?;
        self.metadata_store(name).init().await?;
        Ok(())
    }

    pub async fn stream_exists(&self, name: &str) -> Result<bool> {
        validate_stream_name(name)?;
        Ok(self
            .coordinator
            .get(&self.stream_path(name))
            .await?
            .is_some())
    }

    /// List the stream's segments in order.
    pub async fn list_segments(
        &self,
        name: &str,
    ) -> Result<Vec<streamlog_metadata::SegmentMetadata>> {
        validate_stream_name(name)?;
        Ok(self.metadata_store(name).list().await?)
    }

    /// Open the stream's single writer, acquiring the stream lock and
    /// recovering any segment the previous owner left in progress. The
    /// stream is created if it does not exist.
    pub async fn open_writer(&self, name: &str) -> Result<LogWriter> {
        validate_stream_name(name)?;
        let metadata = self.metadata_store(name);
        metadata.init().await?;
        let lock = DistributedLock::new(
            Arc::clone(&self.coordinator),
            format!("{}/lock", self.stream_path(name)),
            self.client_id.clone(),
            Duration::from_millis(self.config.lock_timeout_ms.max(1)),
        );
        LogWriter::open(
            name.to_string(),
            self.config.clone(),
            Arc::clone(&self.entry_store),
            metadata,
            lock,
        )
        .await
    }

    /// Open a reader positioned at the first record with
    /// `position >= start`.
    pub async fn open_reader(&self, name: &str, start: Position) -> Result<LogReader> {
        validate_stream_name(name)?;
        if !self.stream_exists(name).await? {
            return Err(Error::LogNotFound(name.to_string()));
        }
        Ok(LogReader::open(
            name.to_string(),
            self.config.clone(),
            self.metadata_store(name),
            Arc::clone(&self.handle_cache),
            start,
        ))
    }
}
