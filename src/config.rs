use std::time::Duration;

use serde::Deserialize;

/// Engine tunables.
///
/// Every field has a default matching the behavior of the shipped client;
/// hosts usually deserialize this from their own configuration file and
/// override a handful of values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed buffer size used when streaming a fetched body to the kernel.
    pub transfer_buffer_size: usize,
    /// Transfer chunk sizes are clamped into this range.
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Parallel width of the upload pool.
    pub upload_pool_size: usize,
    /// Parallel width of the reconciler's subtree pool.
    pub reconcile_pool_size: usize,
    /// Sleep between change-log polls.
    pub change_poll_interval: Duration,
    /// How long `stop` waits for in-flight callbacks to leave the gate.
    pub dispatch_drain_timeout: Duration,
    /// How long `stop` waits for background loops to finish.
    pub queue_drain_timeout: Duration,
    /// How long `stop` waits for spawned fetch tasks.
    pub fetch_drain_timeout: Duration,
    /// Remote task polling: attempt cap and per-attempt sleep range.
    pub task_poll_attempts: u32,
    pub task_poll_min_delay: Duration,
    pub task_poll_max_delay: Duration,
    /// How long identity blobs handed to the kernel stay retained.
    pub identity_retention: Duration,
    /// Capacity of the per-path byte-URL cache.
    pub url_cache_capacity: u64,
    /// Registration retries on transient busy errors.
    pub register_retry_attempts: u32,
    /// Process image patterns whose enumerations are answered empty.
    pub excluded_processes: Vec<String>,
    /// Extra path exclusion patterns on top of the built-in set.
    pub excluded_paths: Vec<String>,
}

impl SyncConfig {
    pub(crate) fn chunk_len(&self) -> usize {
        self.transfer_buffer_size
            .clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transfer_buffer_size: 4 * 1024,
            min_chunk_size: 4 * 1024,
            max_chunk_size: 2 * 1024 * 1024,
            upload_pool_size: 8,
            reconcile_pool_size: 8,
            change_poll_interval: if cfg!(debug_assertions) {
                Duration::from_secs(60)
            } else {
                Duration::from_secs(180)
            },
            dispatch_drain_timeout: Duration::from_secs(5),
            queue_drain_timeout: Duration::from_secs(10),
            fetch_drain_timeout: Duration::from_secs(10),
            task_poll_attempts: 300,
            task_poll_min_delay: Duration::from_secs(3),
            task_poll_max_delay: Duration::from_secs(4),
            identity_retention: Duration::from_secs(300),
            url_cache_capacity: 1024,
            register_retry_attempts: 5,
            excluded_processes: vec![
                "**/SearchProtocolHost.exe".into(),
                "**/SearchFilterHost.exe".into(),
                "**/SearchIndexer.exe".into(),
                "**/svchost.exe".into(),
            ],
            excluded_paths: Vec::new(),
        }
    }
}
