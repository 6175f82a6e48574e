//! Per-queue logical index into the commit log.
//!
//! A consume queue is a dense array of 20-byte entries addressed by logical
//! offset. Entry `n` lives at byte `n * 20` across fixed-size files named by
//! their first byte position. A queue that starts life at a non-zero logical
//! offset (after a resync) leaves the entries before it zeroed.

use super::segment::{list_segment_files, MappedSegment};
use crate::config::StoreConfig;
use crate::dispatcher::{DispatchRequest, DispatchSink};
use crate::{Error, Result};
use bytes::{Buf, BufMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CQ_ENTRY_SIZE: u64 = 20;

/// One consume queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub physical_offset: u64,
    pub size: u32,
    pub tags_code: u64,
}

impl CqEntry {
    pub fn end_offset(&self) -> u64 {
        self.physical_offset + self.size as u64
    }

    fn encode(&self) -> [u8; CQ_ENTRY_SIZE as usize] {
        let mut out = [0u8; CQ_ENTRY_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_u64(self.physical_offset);
        buf.put_u32(self.size);
        buf.put_u64(self.tags_code);
        out
    }

    /// `None` for an empty (zeroed) slot
    fn decode(mut raw: &[u8]) -> Option<Self> {
        let entry = Self {
            physical_offset: raw.get_u64(),
            size: raw.get_u32(),
            tags_code: raw.get_u64(),
        };
        (entry.size > 0).then_some(entry)
    }
}

#[derive(Debug)]
pub struct ConsumeQueue {
    topic: String,
    queue_id: u32,
    dir: PathBuf,
    file_size: u64,
    files: RwLock<Vec<Arc<MappedSegment>>>,
    min_logical: AtomicU64,
    max_physical_end: AtomicU64,
    write_lock: Mutex<()>,
}

impl ConsumeQueue {
    pub fn open(root: &Path, topic: &str, queue_id: u32, entries_per_file: u64) -> Result<Self> {
        let dir = root.join(topic).join(queue_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let file_size = entries_per_file * CQ_ENTRY_SIZE;

        let mut files = Vec::new();
        for path in list_segment_files(&dir)? {
            files.push(Arc::new(MappedSegment::open(&path, file_size)?));
        }

        let queue = Self {
            topic: topic.to_string(),
            queue_id,
            dir,
            file_size,
            files: RwLock::new(files),
            min_logical: AtomicU64::new(0),
            max_physical_end: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };
        queue.recover();
        Ok(queue)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Position the tail after its last non-empty entry and find the first
    /// live entry of the head file.
    fn recover(&self) {
        let files = self.files.read();
        let (head, tail) = match (files.first(), files.last()) {
            (Some(h), Some(t)) => (h, t),
            _ => return,
        };

        let mut end = 0;
        let mut pos = tail.capacity();
        while pos >= CQ_ENTRY_SIZE {
            pos -= CQ_ENTRY_SIZE;
            if let Some(entry) = read_entry(tail, pos) {
                end = pos + CQ_ENTRY_SIZE;
                self.max_physical_end
                    .store(entry.end_offset(), Ordering::Release);
                break;
            }
        }
        tail.set_positions(end);

        if end == 0 && files.len() > 1 {
            let prev = &files[files.len() - 2];
            if let Some(entry) = read_entry(prev, prev.capacity() - CQ_ENTRY_SIZE) {
                self.max_physical_end
                    .store(entry.end_offset(), Ordering::Release);
            }
        }

        let mut first = head.write_position();
        let mut pos = 0;
        while pos < head.write_position() {
            if read_entry(head, pos).is_some() {
                first = pos;
                break;
            }
            pos += CQ_ENTRY_SIZE;
        }
        self.min_logical.store(
            (head.base_offset() + first) / CQ_ENTRY_SIZE,
            Ordering::Release,
        );

        debug!(
            topic = %self.topic,
            queue_id = self.queue_id,
            min = self.min_offset(),
            max = self.max_offset(),
            "Recovered consume queue"
        );
    }

    /// Append the entry for `logical`. Offsets already present are skipped so
    /// re-dispatching the same records is harmless; a gap is an error.
    pub fn put_entry(&self, logical: u64, entry: CqEntry) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let max = self.max_offset();
        if logical < max {
            return Ok(false);
        }

        let position = logical * CQ_ENTRY_SIZE;
        let segment = if self.files.read().is_empty() {
            let base = position - position % self.file_size;
            let segment = Arc::new(MappedSegment::create(&self.dir, base, self.file_size)?);
            segment.set_positions(position - base);
            self.files.write().push(segment.clone());
            self.min_logical.store(logical, Ordering::Release);
            if logical > 0 {
                info!(
                    topic = %self.topic,
                    queue_id = self.queue_id,
                    logical,
                    "Consume queue starts past zero"
                );
            }
            segment
        } else if logical > max {
            return Err(Error::QueueGap {
                topic: self.topic.clone(),
                queue_id: self.queue_id,
                expected: max,
                actual: logical,
            });
        } else {
            self.tail_for_write()?
        };

        segment.append(&entry.encode())?;
        self.max_physical_end
            .fetch_max(entry.end_offset(), Ordering::AcqRel);
        Ok(true)
    }

    fn tail_for_write(&self) -> Result<Arc<MappedSegment>> {
        let mut files = self.files.write();
        match files.last() {
            Some(tail) if !tail.is_full() => Ok(tail.clone()),
            Some(tail) => {
                let segment = Arc::new(MappedSegment::create(
                    &self.dir,
                    tail.end_offset(),
                    self.file_size,
                )?);
                files.push(segment.clone());
                Ok(segment)
            }
            None => Err(Error::Other("consume queue has no files".into())),
        }
    }

    fn file_for(&self, position: u64) -> Option<Arc<MappedSegment>> {
        let files = self.files.read();
        let idx = files
            .partition_point(|f| f.base_offset() <= position)
            .checked_sub(1)?;
        let file = &files[idx];
        file.contains(position).then(|| file.clone())
    }

    pub fn get_entry(&self, logical: u64) -> Option<CqEntry> {
        if logical < self.min_offset() {
            return None;
        }
        let position = logical * CQ_ENTRY_SIZE;
        let file = self.file_for(position)?;
        read_entry(&file, position - file.base_offset())
    }

    /// Up to `max` consecutive entries starting at `from`.
    pub fn entries(&self, from: u64, max: usize) -> Vec<(u64, CqEntry)> {
        let end = self.max_offset().min(from.saturating_add(max as u64));
        (from.max(self.min_offset())..end)
            .map_while(|logical| self.get_entry(logical).map(|e| (logical, e)))
            .collect()
    }

    pub fn min_offset(&self) -> u64 {
        self.min_logical.load(Ordering::Acquire)
    }

    /// One past the last logical offset
    pub fn max_offset(&self) -> u64 {
        match self.files.read().last() {
            Some(tail) => (tail.base_offset() + tail.write_position()) / CQ_ENTRY_SIZE,
            None => self.min_offset(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_offset() == self.min_offset()
    }

    /// Commit log end of the newest entry
    pub fn last_physical_end(&self) -> u64 {
        self.max_physical_end.load(Ordering::Acquire)
    }

    /// Drop entries referring to bytes at or past `physical_end`.
    pub fn truncate_dirty(&self, physical_end: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut files = self.files.write();

        while let Some(tail) = files.last() {
            let written = tail.write_position();
            let mut cut = None;
            let mut live_before = false;
            let mut pos = 0;
            while pos < written {
                if let Some(entry) = read_entry(tail, pos) {
                    if entry.end_offset() > physical_end {
                        cut = Some(pos);
                        break;
                    }
                    live_before = true;
                }
                pos += CQ_ENTRY_SIZE;
            }

            match cut {
                None => break,
                Some(_) if !live_before && files.len() > 1 => {
                    tail.destroy()?;
                    files.pop();
                }
                Some(pos) => {
                    tail.truncate_to(pos)?;
                    break;
                }
            }
        }

        let mut end = 0;
        if let Some(tail) = files.last() {
            let written = tail.write_position();
            if written >= CQ_ENTRY_SIZE {
                if let Some(entry) = read_entry(tail, written - CQ_ENTRY_SIZE) {
                    end = entry.end_offset();
                }
            } else if files.len() > 1 {
                let prev = &files[files.len() - 2];
                if let Some(entry) = read_entry(prev, prev.capacity() - CQ_ENTRY_SIZE) {
                    end = entry.end_offset();
                }
            }
        }
        drop(files);

        self.max_physical_end.store(end, Ordering::Release);
        let max = self.max_offset();
        self.min_logical.fetch_min(max, Ordering::AcqRel);
        Ok(())
    }

    /// Delete head files whose entries all point below `commit_log_min` and
    /// advance the minimum logical offset past expired entries.
    pub fn correct_min_offset(&self, commit_log_min: u64) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut files = self.files.write();
        let mut deleted = 0;

        while files.len() > 1 {
            let head = &files[0];
            match read_entry(head, head.capacity() - CQ_ENTRY_SIZE) {
                Some(last) if last.physical_offset < commit_log_min => {
                    head.destroy()?;
                    files.remove(0);
                    deleted += 1;
                }
                _ => break,
            }
        }

        if let Some(head) = files.first() {
            let written = head.write_position();
            let mut pos = self.min_offset() * CQ_ENTRY_SIZE;
            pos = pos.max(head.base_offset()) - head.base_offset();
            while pos < written {
                match read_entry(head, pos) {
                    Some(entry) if entry.physical_offset >= commit_log_min => break,
                    _ => pos += CQ_ENTRY_SIZE,
                }
            }
            let logical = (head.base_offset() + pos) / CQ_ENTRY_SIZE;
            self.min_logical.fetch_max(logical, Ordering::AcqRel);
        }

        if deleted > 0 {
            debug!(
                topic = %self.topic,
                queue_id = self.queue_id,
                deleted,
                min = self.min_offset(),
                "Deleted expired consume queue files"
            );
        }
        Ok(deleted)
    }

    pub fn flush(&self) -> Result<()> {
        let files: Vec<_> = self.files.read().iter().cloned().collect();
        for file in files {
            if file.write_position() > file.flushed_position() {
                file.flush()?;
            }
        }
        Ok(())
    }

    /// Delete every file; the queue restarts at whatever offset arrives next.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut files = self.files.write();
        for file in files.drain(..) {
            file.destroy()?;
        }
        self.min_logical.store(0, Ordering::Release);
        self.max_physical_end.store(0, Ordering::Release);
        Ok(())
    }
}

fn read_entry(file: &MappedSegment, pos: u64) -> Option<CqEntry> {
    file.slice(pos, CQ_ENTRY_SIZE as usize).and_then(CqEntry::decode)
}

/// All consume queues of a store, keyed by (topic, queue id).
#[derive(Debug)]
pub struct ConsumeQueueTable {
    root: PathBuf,
    entries_per_file: u64,
    queues: DashMap<(String, u32), Arc<ConsumeQueue>>,
    last_timestamp: AtomicI64,
}

impl ConsumeQueueTable {
    /// Open every `<topic>/<queue id>` directory under the consume queue root.
    pub fn load(config: &StoreConfig) -> Result<Self> {
        let root = config.consume_queue_dir();
        std::fs::create_dir_all(&root)?;
        let table = Self {
            root: root.clone(),
            entries_per_file: config.consume_queue_entries_per_file,
            queues: DashMap::new(),
            last_timestamp: AtomicI64::new(0),
        };

        for topic_entry in std::fs::read_dir(&root)? {
            let topic_dir = topic_entry?.path();
            let topic = match topic_dir.file_name().and_then(|n| n.to_str()) {
                Some(t) if topic_dir.is_dir() => t.to_string(),
                _ => continue,
            };
            for queue_entry in std::fs::read_dir(&topic_dir)? {
                let queue_dir = queue_entry?.path();
                let queue_id = match queue_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    Some(id) => id,
                    None => {
                        warn!(path = %queue_dir.display(), "Skipping unexpected consume queue entry");
                        continue;
                    }
                };
                let queue = ConsumeQueue::open(&root, &topic, queue_id, table.entries_per_file)?;
                table.queues.insert((topic.clone(), queue_id), Arc::new(queue));
            }
        }

        info!(queues = table.queues.len(), "Loaded consume queues");
        Ok(table)
    }

    pub fn get(&self, topic: &str, queue_id: u32) -> Option<Arc<ConsumeQueue>> {
        self.queues
            .get(&(topic.to_string(), queue_id))
            .map(|q| q.value().clone())
    }

    pub fn find_or_create(&self, topic: &str, queue_id: u32) -> Result<Arc<ConsumeQueue>> {
        if let Some(queue) = self.get(topic, queue_id) {
            return Ok(queue);
        }
        let entry = self.queues.entry((topic.to_string(), queue_id));
        let queue = match entry {
            dashmap::mapref::entry::Entry::Occupied(o) => o.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let queue = Arc::new(ConsumeQueue::open(
                    &self.root,
                    topic,
                    queue_id,
                    self.entries_per_file,
                )?);
                v.insert(queue.clone());
                queue
            }
        };
        Ok(queue)
    }

    fn all(&self) -> Vec<Arc<ConsumeQueue>> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn flush_all(&self) -> Result<()> {
        for queue in self.all() {
            queue.flush()?;
        }
        Ok(())
    }

    pub fn truncate_dirty(&self, physical_end: u64) -> Result<()> {
        for queue in self.all() {
            queue.truncate_dirty(physical_end)?;
        }
        Ok(())
    }

    pub fn correct_min_offset(&self, commit_log_min: u64) -> Result<usize> {
        let mut deleted = 0;
        for queue in self.all() {
            deleted += queue.correct_min_offset(commit_log_min)?;
        }
        Ok(deleted)
    }

    pub fn reset_all(&self) -> Result<()> {
        for queue in self.all() {
            queue.reset()?;
        }
        self.last_timestamp.store(0, Ordering::Release);
        Ok(())
    }

    /// Lowest commit log end across non-empty queues. Every record below it
    /// is known to be present in its queue.
    pub fn min_physical_end(&self) -> Option<u64> {
        self.all()
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| q.last_physical_end())
            .min()
    }

    /// Highest commit log end across all queues
    pub fn max_physical_end(&self) -> u64 {
        self.all()
            .iter()
            .map(|q| q.last_physical_end())
            .max()
            .unwrap_or(0)
    }

    /// Next queue offset per queue, for seeding the commit log
    pub fn queue_offset_table(&self) -> crate::storage::QueueOffsetTable {
        self.all()
            .iter()
            .map(|q| ((q.topic().to_string(), q.queue_id()), q.max_offset()))
            .collect()
    }

    /// Store timestamp of the newest dispatched record
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp.load(Ordering::Acquire)
    }
}

impl DispatchSink for ConsumeQueueTable {
    fn name(&self) -> &'static str {
        "consume_queue"
    }

    fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        let queue = self.find_or_create(&request.topic, request.queue_id)?;
        queue.put_entry(
            request.queue_offset,
            CqEntry {
                physical_offset: request.physical_offset,
                size: request.size,
                tags_code: request.tags_code,
            },
        )?;
        self.last_timestamp
            .fetch_max(request.store_timestamp, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(phys: u64) -> CqEntry {
        CqEntry {
            physical_offset: phys,
            size: 100,
            tags_code: 7,
        }
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let cq = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        for i in 0..10 {
            assert!(cq.put_entry(i, entry(i * 100)).unwrap());
        }
        assert_eq!(cq.min_offset(), 0);
        assert_eq!(cq.max_offset(), 10);
        assert_eq!(cq.get_entry(5), Some(entry(500)));
        assert_eq!(cq.get_entry(10), None);
        assert_eq!(cq.last_physical_end(), 1000);

        let batch = cq.entries(8, 5);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], (8, entry(800)));
    }

    #[test]
    fn test_put_is_idempotent_and_rejects_gaps() {
        let dir = TempDir::new().unwrap();
        let cq = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        cq.put_entry(0, entry(0)).unwrap();
        cq.put_entry(1, entry(100)).unwrap();
        assert!(!cq.put_entry(1, entry(100)).unwrap());
        assert!(matches!(
            cq.put_entry(5, entry(500)),
            Err(Error::QueueGap { expected: 2, actual: 5, .. })
        ));
        assert_eq!(cq.max_offset(), 2);
    }

    #[test]
    fn test_queue_can_start_past_zero() {
        let dir = TempDir::new().unwrap();
        let cq = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        cq.put_entry(6, entry(600)).unwrap();
        cq.put_entry(7, entry(700)).unwrap();
        assert_eq!(cq.min_offset(), 6);
        assert_eq!(cq.max_offset(), 8);
        assert_eq!(cq.get_entry(5), None);
        drop(cq);

        let reopened = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        assert_eq!(reopened.min_offset(), 6);
        assert_eq!(reopened.max_offset(), 8);
        assert_eq!(reopened.last_physical_end(), 800);
    }

    #[test]
    fn test_recover_finds_tail() {
        let dir = TempDir::new().unwrap();
        {
            let cq = ConsumeQueue::open(dir.path(), "t", 3, 4).unwrap();
            for i in 0..6 {
                cq.put_entry(i, entry(i * 100)).unwrap();
            }
            cq.flush().unwrap();
        }
        let cq = ConsumeQueue::open(dir.path(), "t", 3, 4).unwrap();
        assert_eq!(cq.max_offset(), 6);
        assert_eq!(cq.last_physical_end(), 600);
        cq.put_entry(6, entry(600)).unwrap();
        assert_eq!(cq.get_entry(6), Some(entry(600)));
    }

    #[test]
    fn test_truncate_dirty() {
        let dir = TempDir::new().unwrap();
        let cq = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        for i in 0..10 {
            cq.put_entry(i, entry(i * 100)).unwrap();
        }
        // records starting at 450 and beyond are gone
        cq.truncate_dirty(450).unwrap();
        assert_eq!(cq.max_offset(), 4);
        assert_eq!(cq.last_physical_end(), 400);
        cq.put_entry(4, entry(400)).unwrap();
        assert_eq!(cq.max_offset(), 5);
    }

    #[test]
    fn test_correct_min_offset() {
        let dir = TempDir::new().unwrap();
        let cq = ConsumeQueue::open(dir.path(), "t", 0, 4).unwrap();
        for i in 0..10 {
            cq.put_entry(i, entry(i * 100)).unwrap();
        }
        assert_eq!(cq.correct_min_offset(550).unwrap(), 1);
        assert_eq!(cq.min_offset(), 6);
        assert_eq!(cq.get_entry(5), None);
        assert_eq!(cq.get_entry(6), Some(entry(600)));
    }

    #[test]
    fn test_table_dispatch_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::compact(dir.path());
        {
            let table = ConsumeQueueTable::load(&config).unwrap();
            for (i, qid) in [0u32, 1, 0].iter().enumerate() {
                let queue_offset = if i == 2 { 1 } else { 0 };
                table
                    .dispatch(&DispatchRequest {
                        topic: "orders".into(),
                        queue_id: *qid,
                        queue_offset,
                        physical_offset: i as u64 * 100,
                        size: 100,
                        tags_code: 0,
                        keys: Vec::new(),
                        store_timestamp: 1000 + i as i64,
                    })
                    .unwrap();
            }
            table.flush_all().unwrap();
            assert_eq!(table.last_timestamp(), 1002);
        }

        let table = ConsumeQueueTable::load(&config).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("orders", 0).unwrap().max_offset(), 2);
        assert_eq!(table.min_physical_end(), Some(200));
        assert_eq!(table.max_physical_end(), 300);
        let offsets = table.queue_offset_table();
        assert_eq!(offsets.get(&("orders".to_string(), 1)), Some(&1));
    }
}
