use super::segment::{list_segment_files, MappedSegment};
use crate::config::{StoreConfig, END_OF_SEGMENT_RESERVE};
use crate::message::{
    decode_record, encode_blank, peek_header, EncodedMessage, RecordHeader, StoredRecord,
    BLANK_MARKER_SIZE,
};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Next queue offset per (topic, queue id)
pub type QueueOffsetTable = HashMap<(String, u32), u64>;

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub physical_offset: u64,
    pub wrote_bytes: u32,
    pub queue_offset: u64,
    pub store_timestamp: i64,
}

impl AppendResult {
    pub fn end_offset(&self) -> u64 {
        self.physical_offset + self.wrote_bytes as u64
    }
}

/// What sits at a given commit log position.
#[derive(Debug)]
pub enum ScanStep {
    Record(StoredRecord),
    /// End-of-segment filler; scanning resumes at `next`
    Blank { next: u64 },
    /// Nothing written here yet
    End,
}

/// Global append-only message log made of fixed-size mapped segments.
///
/// Segment base offsets are multiples of the segment size, so the segment
/// holding any offset is found by a binary search on base offsets. A record
/// never spans two segments.
#[derive(Debug)]
pub struct CommitLog {
    dir: PathBuf,
    segment_size: u64,
    max_message_size: usize,
    segments: RwLock<Vec<Arc<MappedSegment>>>,
    queue_offsets: Mutex<QueueOffsetTable>,
    /// Where an empty log begins
    start_offset: AtomicU64,
    flushed: AtomicU64,
    dispatched: AtomicU64,
    max_tx: watch::Sender<u64>,
    flushed_tx: watch::Sender<u64>,
}

impl CommitLog {
    /// Open the log directory. Existing segments come back as full; recovery
    /// then trims the tail to the end of valid data.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let dir = config.commit_log_dir();
        fs::create_dir_all(&dir)?;

        let mut segments: Vec<Arc<MappedSegment>> = Vec::new();
        for path in list_segment_files(&dir)? {
            let segment = MappedSegment::open(&path, config.commit_log_segment_size)?;
            if segment.base_offset() % config.commit_log_segment_size != 0 {
                return Err(Error::InvalidConfig(format!(
                    "Segment {} is not aligned to segment size {}",
                    path.display(),
                    config.commit_log_segment_size
                )));
            }
            if let Some(prev) = segments.last() {
                if prev.end_offset() != segment.base_offset() {
                    warn!(
                        expected = prev.end_offset(),
                        found = segment.base_offset(),
                        "Hole in commit log segment sequence"
                    );
                }
            }
            segments.push(Arc::new(segment));
        }

        let end = segments.last().map(|s| s.end_offset()).unwrap_or(0);
        info!(dir = %dir.display(), segments = segments.len(), end, "Opened commit log");

        let (max_tx, _) = watch::channel(end);
        let (flushed_tx, _) = watch::channel(end);
        Ok(Self {
            dir,
            segment_size: config.commit_log_segment_size,
            max_message_size: config.max_message_size,
            segments: RwLock::new(segments),
            queue_offsets: Mutex::new(HashMap::new()),
            start_offset: AtomicU64::new(0),
            flushed: AtomicU64::new(end),
            dispatched: AtomicU64::new(end),
            max_tx,
            flushed_tx,
        })
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Append one record. Serialized through a single critical section that
    /// also assigns the per-queue offset.
    pub fn append(&self, mut msg: EncodedMessage) -> Result<AppendResult> {
        let size = msg.len();
        if size > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        let mut queue_offsets = self.queue_offsets.lock();
        let store_timestamp = chrono::Utc::now().timestamp_millis();

        loop {
            let segment = self.tail_for_append()?;
            let pos = segment.write_position();
            let free = segment.capacity() - pos;

            if size as u64 + END_OF_SEGMENT_RESERVE > free {
                segment.append_filler(&encode_blank(free as u32))?;
                debug!(
                    segment = segment.base_offset(),
                    filler = free,
                    "Commit log segment full, rolling"
                );
                continue;
            }

            let physical_offset = segment.base_offset() + pos;
            let key = (msg.topic().to_string(), msg.queue_id());
            let queue_offset = queue_offsets.get(&key).copied().unwrap_or(0);
            msg.stamp(queue_offset, physical_offset, store_timestamp);
            segment.append(msg.as_bytes())?;
            queue_offsets.insert(key, queue_offset + 1);

            let result = AppendResult {
                physical_offset,
                wrote_bytes: size as u32,
                queue_offset,
                store_timestamp,
            };
            self.max_tx.send_replace(result.end_offset());
            return Ok(result);
        }
    }

    /// Segment that the next write goes to, rolling when the tail is full.
    fn tail_for_append(&self) -> Result<Arc<MappedSegment>> {
        if let Some(tail) = self.segments.read().last() {
            if !tail.is_full() {
                return Ok(tail.clone());
            }
        }

        let mut segments = self.segments.write();
        let base = match segments.last() {
            Some(tail) if !tail.is_full() => return Ok(tail.clone()),
            Some(tail) => tail.end_offset(),
            None => self.aligned(self.start_offset.load(Ordering::Acquire)),
        };
        let segment = Arc::new(MappedSegment::create(&self.dir, base, self.segment_size)?);
        if segments.is_empty() {
            segment.set_positions(self.start_offset.load(Ordering::Acquire) - base);
        }
        info!(base_offset = base, "Rolled new commit log segment");
        segments.push(segment.clone());
        Ok(segment)
    }

    fn aligned(&self, offset: u64) -> u64 {
        offset - offset % self.segment_size
    }

    /// Write raw bytes received from a primary at exactly the current end
    /// of the log. Segment boundaries land at the same offsets as on the
    /// primary, so blank fillers are copied byte for byte.
    pub fn append_replicated(&self, offset: u64, mut data: &[u8]) -> Result<u64> {
        let _queue_offsets = self.queue_offsets.lock();
        let expected = self.max_offset();
        if offset != expected {
            return Err(Error::NonContiguousAppend {
                expected,
                actual: offset,
            });
        }

        while !data.is_empty() {
            let segment = self.tail_for_append()?;
            let take = (segment.remaining() as usize).min(data.len());
            segment.append(&data[..take])?;
            data = &data[take..];
        }

        let end = self.max_offset();
        self.max_tx.send_replace(end);
        Ok(end)
    }

    fn segment_for(&self, offset: u64) -> Option<Arc<MappedSegment>> {
        let segments = self.segments.read();
        let idx = segments
            .partition_point(|s| s.base_offset() <= offset)
            .checked_sub(1)?;
        let segment = &segments[idx];
        segment.contains(offset).then(|| segment.clone())
    }

    /// Read `size` bytes at `offset`. Never reads past the write pointer.
    pub fn read(&self, offset: u64, size: usize) -> Result<Bytes> {
        let segment = self
            .segment_for(offset)
            .ok_or(Error::OffsetOutOfRange(offset))?;
        segment.read(offset - segment.base_offset(), size)
    }

    /// Decode and verify the record at `offset`. A corrupted record marks its
    /// segment degraded so later reads fail fast.
    pub fn read_record(&self, offset: u64) -> Result<StoredRecord> {
        match self.scan_at(offset)? {
            ScanStep::Record(record) => Ok(record),
            ScanStep::Blank { .. } | ScanStep::End => Err(Error::OffsetOutOfRange(offset)),
        }
    }

    /// Inspect the commit log at a record boundary.
    pub fn scan_at(&self, offset: u64) -> Result<ScanStep> {
        let segment = match self.segment_for(offset) {
            Some(s) => s,
            None => return Ok(ScanStep::End),
        };
        if segment.is_degraded() {
            return Err(Error::SegmentDegraded(segment.base_offset()));
        }
        let rel = offset - segment.base_offset();
        let written = segment.write_position();
        // a replicated tail may end mid-record; the rest has not arrived yet
        if rel + BLANK_MARKER_SIZE as u64 > written {
            return Ok(ScanStep::End);
        }

        let header = segment
            .slice(rel, BLANK_MARKER_SIZE)
            .and_then(peek_header);
        match header {
            Some(RecordHeader::Blank { size }) if rel + size as u64 == segment.capacity() => {
                Ok(ScanStep::Blank {
                    next: segment.end_offset(),
                })
            }
            Some(RecordHeader::Message { size }) if rel + size as u64 > written => {
                if rel + size as u64 > segment.capacity() {
                    segment.mark_degraded();
                    return Err(Error::corrupted(offset, "record overruns its segment"));
                }
                Ok(ScanStep::End)
            }
            Some(RecordHeader::Message { size }) => {
                let bytes = segment.slice(rel, size as usize).ok_or_else(|| {
                    Error::corrupted(offset, "record extends past the write position")
                })?;
                decode_record(bytes, offset)
                    .inspect_err(|e| {
                        segment.mark_degraded();
                        error!(offset, error = %e, "Corrupted commit log record");
                    })
                    .map(ScanStep::Record)
            }
            _ => {
                segment.mark_degraded();
                error!(offset, "No record header at commit log position");
                Err(Error::corrupted(offset, "no record header"))
            }
        }
    }

    /// Validate the record at `offset` without side effects. Used by recovery,
    /// where an invalid record means end of valid data rather than damage.
    pub fn probe(&self, offset: u64) -> Option<ScanStep> {
        let segment = self.segment_for(offset)?;
        let rel = offset - segment.base_offset();
        match segment.slice(rel, BLANK_MARKER_SIZE).and_then(peek_header)? {
            RecordHeader::Blank { size } if rel + size as u64 == segment.capacity() => {
                Some(ScanStep::Blank {
                    next: segment.end_offset(),
                })
            }
            RecordHeader::Blank { .. } => None,
            RecordHeader::Message { size } => {
                let bytes = segment.slice(rel, size as usize)?;
                decode_record(bytes, offset).ok().map(ScanStep::Record)
            }
        }
    }

    /// Bytes from `offset` up to the write pointer of the segment holding it,
    /// at most `max` of them. `None` when nothing is written at `offset` yet.
    pub fn transfer_slice(&self, offset: u64, max: usize) -> Result<Option<Bytes>> {
        let segment = match self.segment_for(offset) {
            Some(s) => s,
            None => return Ok(None),
        };
        let rel = offset - segment.base_offset();
        let written = segment.write_position();
        if rel >= written {
            return Ok(None);
        }
        let len = ((written - rel) as usize).min(max);
        segment.read(rel, len).map(Some)
    }

    /// Flush every segment holding unflushed bytes.
    pub fn flush(&self) -> Result<u64> {
        let from = self.flushed.load(Ordering::Acquire);
        let pending: Vec<_> = self
            .segments
            .read()
            .iter()
            .filter(|s| s.end_offset() > from)
            .cloned()
            .collect();

        let mut flushed = from;
        for segment in pending {
            let pos = segment.flush()?;
            flushed = flushed.max(segment.base_offset() + pos);
        }
        let flushed = self.flushed.fetch_max(flushed, Ordering::AcqRel).max(flushed);
        self.flushed_tx.send_if_modified(|current| {
            if *current != flushed {
                *current = flushed;
                true
            } else {
                false
            }
        });
        Ok(flushed)
    }

    /// Discard everything from `offset` on. Recovery only.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let _queue_offsets = self.queue_offsets.lock();
        let mut segments = self.segments.write();

        while let Some(tail) = segments.last() {
            if tail.base_offset() < offset {
                break;
            }
            tail.destroy()?;
            segments.pop();
        }
        if let Some(tail) = segments.last() {
            if tail.contains(offset) {
                tail.truncate_to(offset - tail.base_offset())?;
            }
        } else {
            self.start_offset.store(offset, Ordering::Release);
        }
        drop(segments);

        self.flushed.fetch_min(offset, Ordering::AcqRel);
        self.dispatched.fetch_min(offset, Ordering::AcqRel);
        self.max_tx.send_replace(self.max_offset());
        self.flushed_tx.send_replace(self.flushed_offset());
        info!(offset, "Truncated commit log");
        Ok(())
    }

    /// Drop every segment and restart the log at `start` (backup resync).
    pub fn reset(&self, start: u64) -> Result<()> {
        let _queue_offsets = self.queue_offsets.lock();
        let mut segments = self.segments.write();
        for segment in segments.drain(..) {
            segment.destroy()?;
        }
        drop(segments);

        self.start_offset.store(start, Ordering::Release);
        self.flushed.store(start, Ordering::Release);
        self.dispatched.store(start, Ordering::Release);
        self.max_tx.send_replace(start);
        self.flushed_tx.send_replace(start);
        warn!(start, "Commit log reset");
        Ok(())
    }

    /// Delete full segments older than `reserved`, oldest first. The tail
    /// and anything not yet dispatched are never reclaimed.
    pub fn reclaim_expired(&self, reserved: Duration, now: SystemTime) -> Result<Vec<u64>> {
        let dispatched = self.dispatched_offset();
        let mut reclaimed = Vec::new();
        let mut segments = self.segments.write();

        while segments.len() > 1 {
            let oldest = &segments[0];
            if oldest.end_offset() > dispatched {
                break;
            }
            let modified = oldest.last_modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < reserved {
                break;
            }
            oldest.destroy()?;
            reclaimed.push(oldest.base_offset());
            segments.remove(0);
        }

        if !reclaimed.is_empty() {
            info!(
                segments = reclaimed.len(),
                min_offset = segments.first().map(|s| s.base_offset()),
                "Reclaimed expired commit log segments"
            );
        }
        Ok(reclaimed)
    }

    pub fn min_offset(&self) -> u64 {
        let start = self.start_offset.load(Ordering::Acquire);
        match self.segments.read().first() {
            Some(first) => first.base_offset().max(start),
            None => start,
        }
    }

    pub fn max_offset(&self) -> u64 {
        match self.segments.read().last() {
            Some(tail) => tail.base_offset() + tail.write_position(),
            None => self.start_offset.load(Ordering::Acquire),
        }
    }

    pub fn flushed_offset(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    pub fn dispatched_offset(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Publish the dispatch horizon. Clamped to the flushed offset.
    pub fn mark_dispatched(&self, offset: u64) {
        let offset = offset.min(self.flushed_offset());
        self.dispatched.fetch_max(offset, Ordering::AcqRel);
        for segment in self.segments.read().iter() {
            if segment.base_offset() >= offset {
                break;
            }
            segment.set_committed((offset - segment.base_offset()).min(segment.capacity()));
        }
    }

    /// Trim the tail to `end` and set all horizons there (recovery).
    pub fn set_recovered_end(&self, end: u64) -> Result<()> {
        self.truncate_to(end)?;
        if let Some(tail) = self.segments.read().last() {
            tail.set_positions(end - tail.base_offset());
        }
        self.flushed.store(end, Ordering::Release);
        self.dispatched.store(end, Ordering::Release);
        self.max_tx.send_replace(end);
        self.flushed_tx.send_replace(end);
        Ok(())
    }

    /// Lower the dispatch horizon so derived structures are rebuilt from `offset`.
    pub fn rewind_dispatched(&self, offset: u64) {
        self.dispatched.store(offset, Ordering::Release);
    }

    pub fn set_queue_offsets(&self, table: QueueOffsetTable) {
        *self.queue_offsets.lock() = table;
    }

    pub fn queue_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.queue_offsets
            .lock()
            .get(&(topic.to_string(), queue_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe_max_offset(&self) -> watch::Receiver<u64> {
        self.max_tx.subscribe()
    }

    pub fn subscribe_flushed_offset(&self) -> watch::Receiver<u64> {
        self.flushed_tx.subscribe()
    }

    /// Base of the segment holding `offset`; the oldest base when `offset`
    /// precedes every segment.
    pub fn segment_base_for(&self, offset: u64) -> u64 {
        let segments = self.segments.read();
        let idx = segments.partition_point(|s| s.base_offset() <= offset);
        match idx.checked_sub(1).and_then(|i| segments.get(i)) {
            Some(segment) => segment.base_offset(),
            None => segments
                .first()
                .map(|s| s.base_offset())
                .unwrap_or_else(|| self.start_offset.load(Ordering::Acquire)),
        }
    }

    /// Segment base offsets, oldest first
    pub fn segment_bases(&self) -> Vec<u64> {
        self.segments.read().iter().map(|s| s.base_offset()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tempfile::TempDir;

    fn host() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10911)
    }

    fn small_config(dir: &TempDir, segment_size: u64) -> StoreConfig {
        StoreConfig::compact(dir.path())
            .with_commit_log_segment_size(segment_size)
            .with_max_message_size(512)
    }

    fn encoded(topic: &str, queue_id: u32, body: &[u8]) -> EncodedMessage {
        NewMessage::new(topic, queue_id, body.to_vec())
            .encode(host())
            .unwrap()
    }

    #[test]
    fn test_append_assigns_offsets() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 4096)).unwrap();

        let a = log.append(encoded("t", 0, b"one")).unwrap();
        let b = log.append(encoded("t", 0, b"two")).unwrap();
        let c = log.append(encoded("t", 1, b"three")).unwrap();

        assert_eq!(a.physical_offset, 0);
        assert_eq!(b.physical_offset, a.end_offset());
        assert_eq!((a.queue_offset, b.queue_offset, c.queue_offset), (0, 1, 0));
        assert_eq!(log.max_offset(), c.end_offset());
        assert_eq!(log.queue_offset("t", 0), 2);

        let rec = log.read_record(b.physical_offset).unwrap();
        assert_eq!(rec.body.as_ref(), b"two");
        assert_eq!(rec.queue_offset, 1);
    }

    #[test]
    fn test_roll_never_splits_records() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 1024)).unwrap();

        let mut results = Vec::new();
        for i in 0..20u8 {
            results.push(log.append(encoded("t", 0, &[i; 150])).unwrap());
        }
        for r in &results {
            let seg_start = r.physical_offset - r.physical_offset % 1024;
            assert!(r.end_offset() + END_OF_SEGMENT_RESERVE <= seg_start + 1024);
        }
        assert!(log.segment_bases().len() > 1);
        assert!(log.segment_bases().iter().all(|b| b % 1024 == 0));

        // the filler at the end of the first segment points at the second
        let first_in_second = results.iter().find(|r| r.physical_offset >= 1024).unwrap();
        assert_eq!(first_in_second.physical_offset, 1024);
        let last_in_first = results.iter().filter(|r| r.physical_offset < 1024).last().unwrap();
        match log.scan_at(last_in_first.end_offset()).unwrap() {
            ScanStep::Blank { next } => assert_eq!(next, 1024),
            other => panic!("expected blank, got {:?}", other),
        }
    }

    #[test]
    fn test_message_too_large() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 4096)).unwrap();
        let err = log.append(encoded("t", 0, &[0u8; 600])).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { max: 512, .. }));
        assert_eq!(log.max_offset(), 0);
    }

    #[test]
    fn test_flush_advances_and_notifies() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 4096)).unwrap();
        let rx = log.subscribe_flushed_offset();
        let r = log.append(encoded("t", 0, b"x")).unwrap();
        assert_eq!(log.flushed_offset(), 0);
        assert_eq!(log.flush().unwrap(), r.end_offset());
        assert_eq!(*rx.borrow(), r.end_offset());

        log.mark_dispatched(u64::MAX);
        assert_eq!(log.dispatched_offset(), r.end_offset());
    }

    #[test]
    fn test_truncate_discards_tail() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 1024)).unwrap();
        let results: Vec<_> = (0..15u8)
            .map(|i| log.append(encoded("t", 0, &[i; 150])).unwrap())
            .collect();
        let cut = results[3].physical_offset;

        log.truncate_to(cut).unwrap();
        assert_eq!(log.max_offset(), cut);
        assert_eq!(log.segment_bases(), vec![0]);
        assert!(matches!(log.scan_at(cut).unwrap(), ScanStep::End));
        assert_eq!(log.read_record(results[2].physical_offset).unwrap().body[0], 2);
    }

    #[test]
    fn test_replicated_append_matches_source() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src = CommitLog::open(&small_config(&src_dir, 1024)).unwrap();
        let dst = CommitLog::open(&small_config(&dst_dir, 1024)).unwrap();

        for i in 0..12u8 {
            src.append(encoded("t", 0, &[i; 100])).unwrap();
        }

        let mut offset = 0;
        while let Some(chunk) = src.transfer_slice(offset, 300).unwrap() {
            offset = dst.append_replicated(offset, &chunk).unwrap();
        }
        assert_eq!(dst.max_offset(), src.max_offset());
        assert_eq!(
            dst.read(0, 1024).unwrap(),
            src.read(0, 1024).unwrap()
        );

        let err = dst.append_replicated(5, b"xx").unwrap_err();
        assert!(matches!(err, Error::NonContiguousAppend { .. }));
    }

    #[test]
    fn test_reset_restarts_at_offset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 1024)).unwrap();
        log.append(encoded("t", 0, b"x")).unwrap();

        log.reset(4096).unwrap();
        assert_eq!(log.min_offset(), 4096);
        assert_eq!(log.max_offset(), 4096);
        log.append_replicated(4096, b"abc").unwrap();
        assert_eq!(log.segment_bases(), vec![4096]);
        assert_eq!(log.max_offset(), 4099);
    }

    #[test]
    fn test_corrupted_read_degrades_segment() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir, 4096);
        let offset = {
            let log = CommitLog::open(&config).unwrap();
            let r = log.append(encoded("t", 0, b"payload")).unwrap();
            log.flush().unwrap();
            r.physical_offset
        };
        // flip a body byte on disk
        let path = config.commit_log_dir().join(MappedSegment::file_name(0));
        let mut bytes = fs::read(&path).unwrap();
        bytes[offset as usize + 90] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let log = CommitLog::open(&config).unwrap();
        assert!(log.read_record(offset).unwrap_err().is_fatal());
        assert!(matches!(
            log.read(offset, 4),
            Err(Error::SegmentDegraded(0))
        ));
    }

    #[test]
    fn test_reclaim_keeps_tail_and_undispatched() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(&small_config(&dir, 1024)).unwrap();
        for i in 0..20u8 {
            log.append(encoded("t", 0, &[i; 150])).unwrap();
        }
        let later = SystemTime::now() + Duration::from_secs(3600);

        assert!(log.reclaim_expired(Duration::from_secs(1), later).unwrap().is_empty());

        log.flush().unwrap();
        log.mark_dispatched(u64::MAX);
        let segments = log.segment_bases().len();
        let reclaimed = log.reclaim_expired(Duration::from_secs(1), later).unwrap();
        assert_eq!(reclaimed.len(), segments - 1);
        assert_eq!(log.segment_bases().len(), 1);
        assert!(log.min_offset() > 0);
    }
}
