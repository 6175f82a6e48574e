//! The message store facade.
//!
//! Owns the commit log and its derived structures and runs the background
//! services that keep them moving: flush, dispatch and retention. All three
//! observe one shutdown signal and are joined before the final checkpoint.

use crate::checkpoint::StoreCheckpoint;
use crate::config::{FlushMode, StoreConfig, StoreRole};
use crate::dispatcher::Dispatcher;
use crate::filter::MessageFilter;
use crate::message::{NewMessage, StoredRecord};
use crate::recovery::{recover, StoreLock};
use crate::storage::{AppendResult, CommitLog, ConsumeQueueTable, IndexService};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consume queue entries examined by one pull
const MAX_PULL_SCAN: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutStatus {
    PutOk,
    /// Stored, but not flushed within `sync_flush_timeout`
    FlushDiskTimeout,
    /// Stored, but no backup acknowledged it in time
    ReplicaTimeout,
    /// Stored, but no backup is connected
    ReplicaNotAvailable,
    /// Not stored: this store is a backup
    ServiceNotWritable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutMessageResult {
    pub status: PutStatus,
    /// Present whenever the record reached the commit log
    pub append: Option<AppendResult>,
}

impl PutMessageResult {
    pub fn is_ok(&self) -> bool {
        self.status == PutStatus::PutOk
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GetMessageStatus {
    Found,
    /// Requested offset is below the queue minimum or past its maximum
    OffsetIllegal,
    /// Requested offset equals the queue maximum
    NoNewMsg,
    /// Entries were scanned but the filter rejected all of them
    NoMatchedMsg,
}

#[derive(Debug, Clone)]
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub messages: Vec<StoredRecord>,
    /// Where the caller should pull next
    pub next_begin_offset: u64,
    pub min_offset: u64,
    pub max_offset: u64,
}

impl GetMessageResult {
    fn empty(status: GetMessageStatus, next_begin_offset: u64, min_offset: u64, max_offset: u64) -> Self {
        Self {
            status,
            messages: Vec::new(),
            next_begin_offset,
            min_offset,
            max_offset,
        }
    }
}

/// Replica acknowledgement, implemented by the HA primary.
#[async_trait]
pub trait ReplicaAck: Send + Sync {
    /// Whether any backup is connected right now
    fn has_replica(&self) -> bool;

    /// Wait until a backup has acknowledged `offset`. False on timeout.
    async fn wait_for_ack(&self, offset: u64, timeout: Duration) -> bool;
}

#[derive(Debug, Default)]
struct StoreStats {
    puts_total: AtomicU64,
    put_bytes: AtomicU64,
    put_failures: AtomicU64,
    gets_total: AtomicU64,
    messages_returned: AtomicU64,
    flushes_total: AtomicU64,
    checkpoints_total: AtomicU64,
    reclaimed_segments: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub puts_total: u64,
    pub put_bytes: u64,
    pub put_failures: u64,
    pub gets_total: u64,
    pub messages_returned: u64,
    pub flushes_total: u64,
    pub checkpoints_total: u64,
    pub reclaimed_segments: u64,
    pub min_physical_offset: u64,
    pub max_physical_offset: u64,
    pub flushed_offset: u64,
    pub dispatched_offset: u64,
    pub consume_queues: usize,
    pub dispatcher_halted: bool,
}

/// State shared with the background services
#[derive(Debug)]
struct StoreCore {
    config: StoreConfig,
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueTable>,
    index: Arc<IndexService>,
    dispatcher: Arc<Dispatcher>,
    /// Last checkpoint written; timestamps only move forward
    checkpoint: Mutex<StoreCheckpoint>,
    stats: StoreStats,
}

impl StoreCore {
    /// Flush the derived structures and persist how far they are durable.
    fn checkpoint(&self) -> Result<()> {
        let consume_queue_timestamp = self.consume_queues.last_timestamp();
        let index_timestamp = self.index.last_timestamp();
        let commit_log_flushed = self.commit_log.flushed_offset();
        self.dispatcher.flush_sinks()?;

        let mut last = self.checkpoint.lock();
        let next = StoreCheckpoint {
            commit_log_flushed,
            consume_queue_timestamp: consume_queue_timestamp.max(last.consume_queue_timestamp),
            index_timestamp: index_timestamp.max(last.index_timestamp),
        };
        next.save(&self.config.checkpoint_path())?;
        *last = next;
        self.stats.checkpoints_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<u64> {
        let flushed = self.commit_log.flush()?;
        self.stats.flushes_total.fetch_add(1, Ordering::Relaxed);
        Ok(flushed)
    }

    /// Drop expired commit log segments and whatever pointed into them.
    fn reclaim_expired(&self) -> Result<usize> {
        let reclaimed = self
            .commit_log
            .reclaim_expired(self.config.file_reserved_time, SystemTime::now())?;
        let min = self.commit_log.min_offset();
        let queue_files = self.consume_queues.correct_min_offset(min)?;
        let index_files = self.index.delete_below(min)?;
        if !reclaimed.is_empty() {
            self.stats
                .reclaimed_segments
                .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
            info!(
                segments = reclaimed.len(),
                queue_files,
                index_files,
                min_offset = min,
                "Retention pass reclaimed files"
            );
        }
        Ok(reclaimed.len())
    }
}

/// A local message store: one commit log, per-queue consume queues and a
/// key index.
pub struct MessageStore {
    core: Arc<StoreCore>,
    flush_notify: Arc<Notify>,
    replica_ack: RwLock<Option<Arc<dyn ReplicaAck>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lock: Mutex<Option<StoreLock>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("root", &self.core.config.root_dir)
            .field("role", &self.core.config.role)
            .field("max_offset", &self.core.commit_log.max_offset())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MessageStore {
    /// Recover the store under `config.root_dir` and start its services.
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let recovery_config = config.clone();
        let recovered = tokio::task::spawn_blocking(move || recover(&recovery_config))
            .await
            .map_err(|e| Error::Other(format!("recovery task failed: {}", e)))??;

        let core = Arc::new(StoreCore {
            config,
            commit_log: recovered.commit_log,
            consume_queues: recovered.consume_queues,
            index: recovered.index,
            dispatcher: recovered.dispatcher,
            checkpoint: Mutex::new(recovered.checkpoint),
            stats: StoreStats::default(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_notify = Arc::new(Notify::new());
        let tasks = vec![
            spawn_flush_service(core.clone(), flush_notify.clone(), shutdown_rx.clone()),
            core.dispatcher.spawn(shutdown_rx.clone()),
            spawn_retention_service(core.clone(), shutdown_rx),
        ];

        info!(
            root = %core.config.root_dir.display(),
            role = ?core.config.role,
            clean = recovered.clean,
            max_offset = core.commit_log.max_offset(),
            "Message store opened"
        );

        Ok(Arc::new(Self {
            core,
            flush_notify,
            replica_ack: RwLock::new(None),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            lock: Mutex::new(Some(recovered.lock)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.core.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Append one message. Invalid or oversized messages are errors; the
    /// status reports durability and replication outcomes.
    pub async fn put_message(&self, msg: NewMessage) -> Result<PutMessageResult> {
        self.ensure_open()?;
        if !self.core.config.role.is_primary() {
            return Ok(PutMessageResult {
                status: PutStatus::ServiceNotWritable,
                append: None,
            });
        }

        let stats = &self.core.stats;
        let append = msg
            .encode(self.core.config.store_host)
            .and_then(|encoded| self.core.commit_log.append(encoded))
            .inspect_err(|e| {
                stats.put_failures.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %msg.topic, error = %e, "Rejected message");
            })?;
        stats.puts_total.fetch_add(1, Ordering::Relaxed);
        stats
            .put_bytes
            .fetch_add(append.wrote_bytes as u64, Ordering::Relaxed);

        let end = append.end_offset();
        let mut status = PutStatus::PutOk;
        if self.core.config.flush_mode == FlushMode::Sync && !self.wait_flushed(end).await {
            warn!(offset = append.physical_offset, "Flush did not complete in time");
            status = PutStatus::FlushDiskTimeout;
        }
        if status == PutStatus::PutOk && self.core.config.role == StoreRole::SyncPrimary {
            status = self.wait_replicated(end).await;
        }

        Ok(PutMessageResult {
            status,
            append: Some(append),
        })
    }

    async fn wait_flushed(&self, offset: u64) -> bool {
        let mut flushed = self.core.commit_log.subscribe_flushed_offset();
        self.flush_notify.notify_one();
        let waited = tokio::time::timeout(
            self.core.config.sync_flush_timeout,
            flushed.wait_for(|f| *f >= offset),
        )
        .await;
        matches!(waited, Ok(Ok(_)))
    }

    async fn wait_replicated(&self, offset: u64) -> PutStatus {
        let ack = self.replica_ack.read().clone();
        match ack {
            Some(ack) if ack.has_replica() => {
                if ack
                    .wait_for_ack(offset, self.core.config.sync_replica_timeout)
                    .await
                {
                    PutStatus::PutOk
                } else {
                    warn!(offset, "Replica did not acknowledge in time");
                    PutStatus::ReplicaTimeout
                }
            }
            _ => PutStatus::ReplicaNotAvailable,
        }
    }

    /// Pull up to `max_count` messages from a queue starting at logical
    /// `offset`, stopping early once `max_bytes` would be exceeded.
    pub fn get_message(
        &self,
        topic: &str,
        queue_id: u32,
        offset: u64,
        max_count: usize,
        max_bytes: usize,
        filter: Option<&dyn MessageFilter>,
    ) -> Result<GetMessageResult> {
        self.ensure_open()?;
        self.core.stats.gets_total.fetch_add(1, Ordering::Relaxed);

        let queue = match self.core.consume_queues.get(topic, queue_id) {
            Some(queue) => queue,
            None => {
                let status = if offset == 0 {
                    GetMessageStatus::NoNewMsg
                } else {
                    GetMessageStatus::OffsetIllegal
                };
                return Ok(GetMessageResult::empty(status, 0, 0, 0));
            }
        };

        let min = queue.min_offset();
        let max = queue.max_offset();
        if offset < min {
            return Ok(GetMessageResult::empty(GetMessageStatus::OffsetIllegal, min, min, max));
        }
        if offset == max {
            return Ok(GetMessageResult::empty(GetMessageStatus::NoNewMsg, offset, min, max));
        }
        if offset > max {
            return Ok(GetMessageResult::empty(GetMessageStatus::OffsetIllegal, max, min, max));
        }

        let max_count = max_count.clamp(1, self.core.config.max_get_batch);
        let commit_log_min = self.core.commit_log.min_offset();
        let mut messages = Vec::new();
        let mut bytes = 0usize;
        let mut next = offset;
        let mut rejected = 0usize;
        // past entries whose records retention already reclaimed
        let mut reclaimed_end = None;

        for (logical, entry) in queue.entries(offset, MAX_PULL_SCAN) {
            if messages.len() >= max_count {
                break;
            }
            if entry.physical_offset < commit_log_min {
                reclaimed_end = Some(logical + 1);
                next = logical + 1;
                continue;
            }
            if !messages.is_empty() && bytes + entry.size as usize > max_bytes {
                break;
            }
            next = logical + 1;
            if filter.is_some_and(|f| !f.matches_tags_code(entry.tags_code)) {
                rejected += 1;
                continue;
            }
            let record = match self.core.commit_log.read_record(entry.physical_offset) {
                Ok(record) => record,
                // reclaimed between the minimum check and the read
                Err(Error::OffsetOutOfRange(_)) => {
                    reclaimed_end = Some(logical + 1);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if filter.is_some_and(|f| !f.matches_record(&record)) {
                rejected += 1;
                continue;
            }
            bytes += entry.size as usize;
            messages.push(record);
        }

        let status = if !messages.is_empty() {
            GetMessageStatus::Found
        } else if rejected > 0 {
            GetMessageStatus::NoMatchedMsg
        } else {
            // only reclaimed entries, or entries reclaimed under a concurrent
            // retention pass
            let live = queue.min_offset().max(reclaimed_end.unwrap_or(0));
            return Ok(GetMessageResult::empty(
                GetMessageStatus::OffsetIllegal,
                live,
                live,
                max,
            ));
        };
        self.core
            .stats
            .messages_returned
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        Ok(GetMessageResult {
            status,
            messages,
            next_begin_offset: next,
            min_offset: min,
            max_offset: max,
        })
    }

    /// Records whose `KEYS` property holds `key`, stored within
    /// `[begin, end]` (ms), newest first.
    pub fn query_by_key(
        &self,
        topic: &str,
        key: &str,
        max: usize,
        begin: i64,
        end: i64,
    ) -> Result<Vec<StoredRecord>> {
        self.ensure_open()?;
        let limit = self.core.commit_log.dispatched_offset();
        let floor = self.core.commit_log.min_offset();
        let mut found = Vec::new();
        for offset in self.core.index.query(topic, key, max, begin, end) {
            if offset < floor || offset >= limit {
                continue;
            }
            let record = match self.core.commit_log.read_record(offset) {
                Ok(record) => record,
                Err(Error::OffsetOutOfRange(_)) => continue,
                Err(e) => return Err(e),
            };
            if record.topic == topic && record.keys().any(|k| k == key) {
                found.push(record);
            }
        }
        Ok(found)
    }

    pub fn read_record(&self, physical_offset: u64) -> Result<StoredRecord> {
        self.core.commit_log.read_record(physical_offset)
    }

    pub fn min_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.core
            .consume_queues
            .get(topic, queue_id)
            .map(|q| q.min_offset())
            .unwrap_or(0)
    }

    pub fn max_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.core
            .consume_queues
            .get(topic, queue_id)
            .map(|q| q.max_offset())
            .unwrap_or(0)
    }

    pub fn min_physical_offset(&self) -> u64 {
        self.core.commit_log.min_offset()
    }

    pub fn max_physical_offset(&self) -> u64 {
        self.core.commit_log.max_offset()
    }

    pub fn flushed_offset(&self) -> u64 {
        self.core.commit_log.flushed_offset()
    }

    pub fn dispatched_offset(&self) -> u64 {
        self.core.commit_log.dispatched_offset()
    }

    /// Watch of the commit log max offset
    pub fn subscribe_appends(&self) -> watch::Receiver<u64> {
        self.core.commit_log.subscribe_max_offset()
    }

    /// Watch of the commit log flushed offset
    pub fn subscribe_flushed(&self) -> watch::Receiver<u64> {
        self.core.commit_log.subscribe_flushed_offset()
    }

    /// Flush the commit log now.
    pub async fn flush(&self) -> Result<u64> {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.flush())
            .await
            .map_err(|e| Error::Other(format!("flush task failed: {}", e)))?
    }

    /// Raw commit log bytes from `offset` for shipping to a backup, never
    /// crossing a segment boundary. `None` when nothing is written there.
    pub fn transfer_slice(&self, offset: u64, max: usize) -> Result<Option<Bytes>> {
        self.core.commit_log.transfer_slice(offset, max)
    }

    /// Apply bytes received from a primary at `offset`, which must be the
    /// local max offset. Returns the new max offset.
    pub fn append_replicated(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let end = self.core.commit_log.append_replicated(offset, data)?;
        self.flush_notify.notify_one();
        Ok(end)
    }

    /// Discard all local data and restart the log at `start` (rounded down
    /// to a segment boundary). Used by a backup that fell behind the
    /// primary's retained history.
    pub fn reset_for_resync(&self, start: u64) -> Result<()> {
        self.ensure_open()?;
        let segment_size = self.core.commit_log.segment_size();
        let start = start - start % segment_size;
        let core = &self.core;
        core.dispatcher.exclusive(|| -> Result<()> {
            core.commit_log.reset(start)?;
            core.commit_log.set_queue_offsets(Default::default());
            core.consume_queues.reset_all()?;
            core.index.reset()?;
            *core.checkpoint.lock() = StoreCheckpoint::default();
            core.checkpoint()
        })?;
        warn!(start, "Store reset for full resync");
        Ok(())
    }

    pub fn set_replica_ack(&self, ack: Arc<dyn ReplicaAck>) {
        *self.replica_ack.write() = Some(ack);
    }

    /// Run one retention pass now. Returns the number of reclaimed segments.
    pub fn reclaim_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        self.core.reclaim_expired()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        let stats = &self.core.stats;
        let commit_log = &self.core.commit_log;
        StoreStatsSnapshot {
            puts_total: stats.puts_total.load(Ordering::Relaxed),
            put_bytes: stats.put_bytes.load(Ordering::Relaxed),
            put_failures: stats.put_failures.load(Ordering::Relaxed),
            gets_total: stats.gets_total.load(Ordering::Relaxed),
            messages_returned: stats.messages_returned.load(Ordering::Relaxed),
            flushes_total: stats.flushes_total.load(Ordering::Relaxed),
            checkpoints_total: stats.checkpoints_total.load(Ordering::Relaxed),
            reclaimed_segments: stats.reclaimed_segments.load(Ordering::Relaxed),
            min_physical_offset: commit_log.min_offset(),
            max_physical_offset: commit_log.max_offset(),
            flushed_offset: commit_log.flushed_offset(),
            dispatched_offset: commit_log.dispatched_offset(),
            consume_queues: self.core.consume_queues.len(),
            dispatcher_halted: self.core.dispatcher.is_halted(),
        }
    }

    /// Stop the services, flush and dispatch everything, write the final
    /// checkpoint and mark the shutdown clean.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Store service ended abnormally");
            }
        }

        let core = self.core.clone();
        let lock = self.lock.lock().take();
        tokio::task::spawn_blocking(move || -> Result<()> {
            core.flush()?;
            if !core.dispatcher.is_halted() {
                core.dispatcher.run_once()?;
            }
            core.checkpoint()?;
            match std::fs::remove_file(core.config.abort_path()) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            if let Some(lock) = lock {
                lock.release()?;
            }
            info!(
                root = %core.config.root_dir.display(),
                max_offset = core.commit_log.max_offset(),
                "Message store shut down"
            );
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("shutdown task failed: {}", e)))?
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }
}

fn spawn_flush_service(
    core: Arc<StoreCore>,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_checkpoint = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(core.config.flush_interval) => {}
            }

            let checkpoint_due = last_checkpoint.elapsed() >= core.config.checkpoint_interval;
            let worker = core.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                worker.flush()?;
                if checkpoint_due {
                    worker.checkpoint()?;
                }
                Ok(())
            })
            .await;

            match result {
                Ok(Ok(())) => {
                    if checkpoint_due {
                        last_checkpoint = tokio::time::Instant::now();
                    }
                }
                Ok(Err(e)) => error!(error = %e, "Flush failed"),
                Err(e) => error!(error = %e, "Flush task panicked"),
            }
        }
        debug!("Flush service stopped");
    })
}

fn spawn_retention_service(
    core: Arc<StoreCore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(core.config.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let worker = core.clone();
            match tokio::task::spawn_blocking(move || worker.reclaim_expired()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Retention pass failed"),
                Err(e) => error!(error = %e, "Retention task panicked"),
            }
        }
        debug!("Retention service stopped");
    })
}
