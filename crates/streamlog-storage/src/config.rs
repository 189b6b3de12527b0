//! Stream Configuration
//!
//! One config struct drives both the write and read paths:
//!
//! - **output_buffer_size**: transmit the active buffer once this many
//!   payload bytes have accumulated (default: 1KB)
//! - **periodic_flush_ms**: period of the background flusher; the task
//!   actually fires every half period (default: 500ms, 0 disables)
//! - **flush_timeout_ms**: how long `flush` waits for outstanding
//!   transmissions before failing (default: 30s)
//! - **segment rolling**: feature flag plus record-count / byte-size /
//!   age thresholds (0 disables an individual threshold)
//! - **read-ahead**: batch sizing, poll cadence, and entry cache capacity
//! - **idle thresholds**: warn and error limits on time since the reader
//!   last delivered a record
//!
//! Field defaults follow the serde-default pattern so partial configs
//! deserialize cleanly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Transmit the active buffer once this many bytes accumulate (default: 1KB)
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,

    /// Periodic flush period in milliseconds; 0 disables (default: 500)
    #[serde(default = "default_periodic_flush_ms")]
    pub periodic_flush_ms: u64,

    /// Timeout for waiting on outstanding transmissions (default: 30s)
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Master switch for segment rolling (default: true)
    #[serde(default = "default_true")]
    pub segment_rolling_enabled: bool,

    /// Roll after this many records; 0 disables (default: 0)
    #[serde(default)]
    pub max_segment_records: u32,

    /// Roll after this many transmitted bytes; 0 disables (default: 256MB)
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Roll after this segment age in milliseconds; 0 disables (default: 0)
    #[serde(default)]
    pub max_segment_age_ms: u64,

    /// Fail writes with a not-ready error during rolls instead of queueing
    /// them (default: false)
    #[serde(default)]
    pub fail_fast_on_stream_not_ready: bool,

    /// Serve readers from the read-ahead cache (default: true)
    #[serde(default = "default_true")]
    pub read_ahead_enabled: bool,

    /// Initial read-ahead batch size in entries (default: 2)
    #[serde(default = "default_read_ahead_batch_size")]
    pub read_ahead_batch_size: usize,

    /// Read-ahead batch size ceiling (default: 64)
    #[serde(default = "default_read_ahead_max_batch_size")]
    pub read_ahead_max_batch_size: usize,

    /// Read-ahead poll interval while caught up, in ms (default: 50)
    #[serde(default = "default_read_ahead_poll_ms")]
    pub read_ahead_poll_ms: u64,

    /// Entry cache capacity in entries (default: 1024)
    #[serde(default = "default_entry_cache_capacity")]
    pub entry_cache_capacity: usize,

    /// Warn and force a blocking read after this much reader idle time
    /// (default: 2 minutes)
    #[serde(default = "default_reader_idle_warn_ms")]
    pub reader_idle_warn_ms: u64,

    /// Fail the reader after this much idle time (default: effectively never)
    #[serde(default = "default_reader_idle_error_ms")]
    pub reader_idle_error_ms: u64,

    /// Stream lock acquisition timeout (default: 30s)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Attempts to close a segment handle on transient errors (default: 3)
    #[serde(default = "default_close_retry_attempts")]
    pub close_retry_attempts: u32,

    /// Initial backoff between close retries, doubling each attempt
    /// (default: 100ms)
    #[serde(default = "default_close_retry_backoff_ms")]
    pub close_retry_backoff_ms: u64,

    /// Opaque region tag stamped into segment metadata (default: 0)
    #[serde(default)]
    pub region_id: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: default_output_buffer_size(),
            periodic_flush_ms: default_periodic_flush_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            segment_rolling_enabled: true,
            max_segment_records: 0,
            max_segment_bytes: default_max_segment_bytes(),
            max_segment_age_ms: 0,
            fail_fast_on_stream_not_ready: false,
            read_ahead_enabled: true,
            read_ahead_batch_size: default_read_ahead_batch_size(),
            read_ahead_max_batch_size: default_read_ahead_max_batch_size(),
            read_ahead_poll_ms: default_read_ahead_poll_ms(),
            entry_cache_capacity: default_entry_cache_capacity(),
            reader_idle_warn_ms: default_reader_idle_warn_ms(),
            reader_idle_error_ms: default_reader_idle_error_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            close_retry_attempts: default_close_retry_attempts(),
            close_retry_backoff_ms: default_close_retry_backoff_ms(),
            region_id: 0,
        }
    }
}

fn default_output_buffer_size() -> usize {
    1024
}

fn default_periodic_flush_ms() -> u64 {
    500
}

fn default_flush_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_segment_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_read_ahead_batch_size() -> usize {
    2
}

fn default_read_ahead_max_batch_size() -> usize {
    64
}

fn default_read_ahead_poll_ms() -> u64 {
    50
}

fn default_entry_cache_capacity() -> usize {
    1024
}

fn default_reader_idle_warn_ms() -> u64 {
    2 * 60 * 1000
}

fn default_reader_idle_error_ms() -> u64 {
    u64::MAX / 2
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_close_retry_attempts() -> u32 {
    3
}

fn default_close_retry_backoff_ms() -> u64 {
    100
}
