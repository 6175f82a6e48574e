//! Fans durable commit log records out to the derived structures.
//!
//! A single worker walks the commit log in physical order from the dispatch
//! horizon up to the flushed offset. Every sink sees every record exactly in
//! that order; sinks skip records they already hold, so a range can be
//! replayed after a crash.

use crate::message::StoredRecord;
use crate::storage::{CommitLog, ScanStep};
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What a sink needs to know about one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: u32,
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub size: u32,
    pub tags_code: u64,
    pub keys: Vec<String>,
    pub store_timestamp: i64,
}

impl DispatchRequest {
    pub fn end_offset(&self) -> u64 {
        self.physical_offset + self.size as u64
    }
}

impl From<&StoredRecord> for DispatchRequest {
    fn from(record: &StoredRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            queue_id: record.queue_id,
            queue_offset: record.queue_offset,
            physical_offset: record.physical_offset,
            size: record.total_size,
            tags_code: record.tags_code(),
            keys: record.keys().map(str::to_string).collect(),
            store_timestamp: record.store_timestamp,
        }
    }
}

/// A derived structure rebuilt from the commit log.
pub trait DispatchSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Absorb one record. Must tolerate records it has already seen.
    fn dispatch(&self, request: &DispatchRequest) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

pub struct Dispatcher {
    commit_log: Arc<CommitLog>,
    sinks: Vec<Arc<dyn DispatchSink>>,
    /// Held for every pass so a resync can exclude the worker
    run_lock: Mutex<()>,
    halted: AtomicBool,
    records: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("halted", &self.halted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    pub fn new(commit_log: Arc<CommitLog>, sinks: Vec<Arc<dyn DispatchSink>>) -> Self {
        Self {
            commit_log,
            sinks,
            run_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            records: AtomicU64::new(0),
        }
    }

    /// Dispatch every complete record in `[from, to)`. Returns where it stopped.
    pub fn dispatch_range(&self, from: u64, to: u64) -> Result<u64> {
        let mut cur = from;
        while cur < to {
            match self.commit_log.scan_at(cur)? {
                ScanStep::Record(record) => {
                    if record.end_offset() > to {
                        break;
                    }
                    let request = DispatchRequest::from(&record);
                    for sink in &self.sinks {
                        sink.dispatch(&request)?;
                    }
                    self.records.fetch_add(1, Ordering::Relaxed);
                    cur = record.end_offset();
                }
                ScanStep::Blank { next } => cur = next,
                ScanStep::End => break,
            }
        }
        Ok(cur)
    }

    /// Catch up from the dispatch horizon to the flushed offset.
    pub fn run_once(&self) -> Result<u64> {
        let _guard = self.run_lock.lock();
        let from = self.commit_log.dispatched_offset();
        let to = self.commit_log.flushed_offset();
        if from >= to {
            return Ok(from);
        }
        let reached = self.dispatch_range(from, to)?;
        self.commit_log.mark_dispatched(reached);
        if reached > from {
            debug!(from, reached, "Dispatched records");
        }
        Ok(reached)
    }

    /// Run `f` with the worker excluded.
    pub fn exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.run_lock.lock();
        f()
    }

    pub fn flush_sinks(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn dispatched_records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Spawn the worker. It wakes on every flushed-offset change and exits
    /// after a final pass once `shutdown` flips to true. A failing record
    /// halts it in place; the store stays readable up to that point.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut flushed = self.commit_log.subscribe_flushed_offset();
        tokio::spawn(async move {
            info!("Dispatcher started");
            loop {
                if !dispatcher.is_halted() {
                    let worker = dispatcher.clone();
                    let result = tokio::task::spawn_blocking(move || worker.run_once()).await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            error!(
                                offset = dispatcher.commit_log.dispatched_offset(),
                                error = %e,
                                "Dispatch failed, halting dispatcher"
                            );
                            dispatcher.halted.store(true, Ordering::Release);
                        }
                        Err(e) => {
                            error!(error = %e, "Dispatch task panicked");
                            dispatcher.halted.store(true, Ordering::Release);
                        }
                    }
                }

                tokio::select! {
                    changed = flushed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(
                dispatched = dispatcher.commit_log.dispatched_offset(),
                "Dispatcher stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::message::NewMessage;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, String)>>,
    }

    impl DispatchSink for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
            self.seen
                .lock()
                .push((request.physical_offset, request.topic.clone()));
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn setup(dir: &TempDir) -> (Arc<CommitLog>, Arc<Recorder>, Arc<Dispatcher>) {
        let config = StoreConfig::compact(dir.path())
            .with_commit_log_segment_size(1024)
            .with_max_message_size(512);
        let log = Arc::new(CommitLog::open(&config).unwrap());
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(log.clone(), vec![recorder.clone()]));
        (log, recorder, dispatcher)
    }

    fn append(log: &CommitLog, topic: &str, len: usize) -> u64 {
        let msg = NewMessage::new(topic, 0, vec![0u8; len]).with_keys("k");
        let encoded = msg
            .encode(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1))
            .unwrap();
        log.append(encoded).unwrap().physical_offset
    }

    #[test]
    fn test_only_flushed_records_are_dispatched() {
        let dir = TempDir::new().unwrap();
        let (log, recorder, dispatcher) = setup(&dir);
        append(&log, "a", 10);
        assert_eq!(dispatcher.run_once().unwrap(), 0);
        assert!(recorder.seen.lock().is_empty());

        log.flush().unwrap();
        append(&log, "b", 10);
        dispatcher.run_once().unwrap();
        assert_eq!(recorder.seen.lock().len(), 1);
        assert!(log.dispatched_offset() <= log.flushed_offset());
    }

    #[test]
    fn test_dispatch_crosses_segments_in_order() {
        let dir = TempDir::new().unwrap();
        let (log, recorder, dispatcher) = setup(&dir);
        let offsets: Vec<u64> = (0..12).map(|i| append(&log, &format!("t{}", i), 150)).collect();
        log.flush().unwrap();

        let reached = dispatcher.run_once().unwrap();
        assert_eq!(reached, log.max_offset());
        let seen: Vec<u64> = recorder.seen.lock().iter().map(|(o, _)| *o).collect();
        assert_eq!(seen, offsets);
        assert_eq!(dispatcher.dispatched_records(), 12);
    }

    #[test]
    fn test_request_carries_keys_and_tags() {
        let dir = TempDir::new().unwrap();
        let (log, _, _) = setup(&dir);
        let msg = NewMessage::new("t", 2, &b"x"[..])
            .with_tags("TagA")
            .with_keys("k1 k2");
        let r = log
            .append(msg.encode(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).unwrap())
            .unwrap();
        let record = log.read_record(r.physical_offset).unwrap();
        let request = DispatchRequest::from(&record);
        assert_eq!(request.queue_id, 2);
        assert_eq!(request.keys, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(request.tags_code, crate::hash::tags_hash_code(Some("TagA")));
        assert_eq!(request.end_offset(), r.end_offset());
    }

    #[tokio::test]
    async fn test_worker_follows_flushes() {
        let dir = TempDir::new().unwrap();
        let (log, recorder, dispatcher) = setup(&dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = dispatcher.spawn(shutdown_rx);

        for _ in 0..3 {
            append(&log, "t", 20);
        }
        log.flush().unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while recorder.seen.lock().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock().len(), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
