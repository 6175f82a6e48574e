use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Size reserved at the end of every commit log segment for the blank marker.
pub const END_OF_SEGMENT_RESERVE: u64 = 8;

/// When appends become durable relative to the producer acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Producer waits until its record is flushed
    Sync,
    /// Background service flushes on an interval
    #[default]
    Async,
}

/// Replication role of this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    /// Acknowledge once written locally
    #[default]
    AsyncPrimary,
    /// Acknowledge once a backup has the record
    SyncPrimary,
    /// Read-only replica fed by a primary
    Backup,
}

impl StoreRole {
    pub fn is_primary(&self) -> bool {
        !matches!(self, StoreRole::Backup)
    }
}

/// Configuration for a message store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding the commit log and derived structures
    pub root_dir: PathBuf,

    /// Commit log segment file size in bytes
    pub commit_log_segment_size: u64,

    /// Number of 20-byte entries per consume queue file
    pub consume_queue_entries_per_file: u64,

    /// Largest encoded record accepted by `put_message`
    pub max_message_size: usize,

    /// Flush policy
    pub flush_mode: FlushMode,

    /// Background flush interval (async mode)
    pub flush_interval: Duration,

    /// How long a producer waits for its flush (sync mode)
    pub sync_flush_timeout: Duration,

    /// How often consume queues and index files are flushed and the
    /// checkpoint rewritten
    pub checkpoint_interval: Duration,

    /// Hash slots per index file
    pub index_slot_count: u32,

    /// Entries per index file
    pub index_max_entries: u32,

    /// Upper bound on `max_count` for a single `get_message`
    pub max_get_batch: usize,

    /// Retention window for full commit log segments
    pub file_reserved_time: Duration,

    /// How often the retention service runs
    pub cleanup_interval: Duration,

    /// Replication role
    pub role: StoreRole,

    /// How long a sync primary waits for a backup acknowledgement
    pub sync_replica_timeout: Duration,

    /// Address stamped into every record as the store host
    pub store_host: SocketAddrV4,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./store"),
            commit_log_segment_size: 1024 * 1024 * 1024, // 1GB
            consume_queue_entries_per_file: 300_000,
            max_message_size: 4 * 1024 * 1024, // 4MB
            flush_mode: FlushMode::Async,
            flush_interval: Duration::from_millis(500),
            sync_flush_timeout: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(1),
            index_slot_count: 5_000_000,
            index_max_entries: 20_000_000,
            max_get_batch: 32,
            file_reserved_time: Duration::from_secs(72 * 60 * 60),
            cleanup_interval: Duration::from_secs(10),
            role: StoreRole::AsyncPrimary,
            sync_replica_timeout: Duration::from_secs(5),
            store_host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10911),
        }
    }
}

impl StoreConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Small files and short intervals, for embedded use and tests
    pub fn compact(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            commit_log_segment_size: 1024 * 1024, // 1MB
            consume_queue_entries_per_file: 1024,
            max_message_size: 256 * 1024,
            flush_interval: Duration::from_millis(20),
            checkpoint_interval: Duration::from_millis(100),
            index_slot_count: 1024,
            index_max_entries: 4096,
            cleanup_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Durability-focused configuration
    pub fn durable(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            flush_mode: FlushMode::Sync,
            ..Self::new(root_dir)
        }
    }

    pub fn with_commit_log_segment_size(mut self, size: u64) -> Self {
        self.commit_log_segment_size = size;
        self
    }

    pub fn with_consume_queue_entries_per_file(mut self, entries: u64) -> Self {
        self.consume_queue_entries_per_file = entries;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_role(mut self, role: StoreRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_file_reserved_time(mut self, reserved: Duration) -> Self {
        self.file_reserved_time = reserved;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_index_limits(mut self, slots: u32, entries: u32) -> Self {
        self.index_slot_count = slots;
        self.index_max_entries = entries;
        self
    }

    pub fn with_sync_replica_timeout(mut self, timeout: Duration) -> Self {
        self.sync_replica_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let min_segment = self.max_message_size as u64 + END_OF_SEGMENT_RESERVE;
        if self.commit_log_segment_size < min_segment {
            return Err(Error::InvalidConfig(format!(
                "commit_log_segment_size {} must hold max_message_size plus {} reserved bytes",
                self.commit_log_segment_size, END_OF_SEGMENT_RESERVE
            )));
        }
        if self.consume_queue_entries_per_file == 0 {
            return Err(Error::InvalidConfig(
                "consume_queue_entries_per_file must be positive".into(),
            ));
        }
        if self.index_slot_count == 0 || self.index_max_entries < 2 {
            return Err(Error::InvalidConfig(
                "index files need at least one slot and two entries".into(),
            ));
        }
        if self.flush_interval.is_zero()
            || self.checkpoint_interval.is_zero()
            || self.cleanup_interval.is_zero()
        {
            return Err(Error::InvalidConfig("service intervals must be positive".into()));
        }
        if self.max_get_batch == 0 {
            return Err(Error::InvalidConfig("max_get_batch must be positive".into()));
        }
        Ok(())
    }

    pub fn commit_log_dir(&self) -> PathBuf {
        self.root_dir.join("commitlog")
    }

    pub fn consume_queue_dir(&self) -> PathBuf {
        self.root_dir.join("consumequeue")
    }

    pub fn consume_queue_ext_dir(&self) -> PathBuf {
        self.root_dir.join("consumequeue_ext")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root_dir.join("index")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root_dir.join("checkpoint")
    }

    pub fn abort_path(&self) -> PathBuf {
        self.root_dir.join("abort")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root_dir.join("lock")
    }
}
