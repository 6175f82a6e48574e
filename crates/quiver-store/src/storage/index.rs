//! Hash index from `topic#key` to commit log offsets.
//!
//! File layout:
//!
//! ```text
//! +-----------------+--------------------+------------------------+
//! | header (40)     | slots (4 * slots)  | entries (20 * entries) |
//! +-----------------+--------------------+------------------------+
//! ```
//!
//! A slot holds the number of the newest entry hashed to it; each entry
//! links to the previous entry of the same slot. Entry 0 is never used so
//! that 0 can mean "empty".

use crate::config::StoreConfig;
use crate::dispatcher::{DispatchRequest, DispatchSink};
use crate::hash::index_key_hash;
use crate::{Error, Result};
use bytes::{Buf, BufMut};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HEADER_SIZE: usize = 40;
const SLOT_SIZE: usize = 4;
const ENTRY_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IndexHeader {
    begin_timestamp: i64,
    end_timestamp: i64,
    begin_physical_offset: u64,
    end_physical_offset: u64,
    slots_used: u32,
    /// Next entry number; starts at 1
    index_count: u32,
}

impl IndexHeader {
    fn read(mut raw: &[u8]) -> Self {
        Self {
            begin_timestamp: raw.get_i64(),
            end_timestamp: raw.get_i64(),
            begin_physical_offset: raw.get_u64(),
            end_physical_offset: raw.get_u64(),
            slots_used: raw.get_u32(),
            index_count: raw.get_u32().max(1),
        }
    }

    fn write(&self, mut out: &mut [u8]) {
        out.put_i64(self.begin_timestamp);
        out.put_i64(self.end_timestamp);
        out.put_u64(self.begin_physical_offset);
        out.put_u64(self.end_physical_offset);
        out.put_u32(self.slots_used);
        out.put_u32(self.index_count);
    }
}

/// One index file
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    slot_count: u32,
    max_entries: u32,
    mmap: MmapMut,
    header: IndexHeader,
}

impl IndexFile {
    fn file_size(slot_count: u32, max_entries: u32) -> u64 {
        (HEADER_SIZE + slot_count as usize * SLOT_SIZE + max_entries as usize * ENTRY_SIZE) as u64
    }

    pub fn create(path: &Path, slot_count: u32, max_entries: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(Self::file_size(slot_count, max_entries))?;
        // SAFETY: the file was just created by us and is only accessed
        // through this mapping, guarded by the owning service's locks.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut index = Self {
            path: path.to_path_buf(),
            slot_count,
            max_entries,
            mmap,
            header: IndexHeader {
                index_count: 1,
                ..Default::default()
            },
        };
        index.write_header();
        Ok(index)
    }

    pub fn open(path: &Path, slot_count: u32, max_entries: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = Self::file_size(slot_count, max_entries);
        if file.metadata()?.len() != expected {
            return Err(Error::InvalidConfig(format!(
                "Index file {} does not match configured slot/entry counts",
                path.display()
            )));
        }
        // SAFETY: index files are owned exclusively by this store (the
        // store lock file is held) and only accessed through this mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = IndexHeader::read(&mmap[..HEADER_SIZE]);
        Ok(Self {
            path: path.to_path_buf(),
            slot_count,
            max_entries,
            mmap,
            header,
        })
    }

    fn write_header(&mut self) {
        let header = self.header;
        header.write(&mut self.mmap[..HEADER_SIZE]);
    }

    fn slot_pos(&self, key_hash: u32) -> usize {
        HEADER_SIZE + (key_hash % self.slot_count) as usize * SLOT_SIZE
    }

    fn entry_pos(&self, n: u32) -> usize {
        HEADER_SIZE + self.slot_count as usize * SLOT_SIZE + n as usize * ENTRY_SIZE
    }

    pub fn is_full(&self) -> bool {
        self.header.index_count >= self.max_entries
    }

    pub fn entry_count(&self) -> u32 {
        self.header.index_count - 1
    }

    pub fn begin_timestamp(&self) -> i64 {
        self.header.begin_timestamp
    }

    pub fn end_timestamp(&self) -> i64 {
        self.header.end_timestamp
    }

    pub fn end_physical_offset(&self) -> u64 {
        self.header.end_physical_offset
    }

    /// Add one key. Returns `false` when the file is full.
    pub fn put(&mut self, key_hash: u32, physical_offset: u64, store_timestamp: i64) -> bool {
        if self.is_full() {
            return false;
        }
        let n = self.header.index_count;
        let slot_pos = self.slot_pos(key_hash);
        let mut prev = (&self.mmap[slot_pos..slot_pos + SLOT_SIZE]).get_u32();
        if prev == 0 {
            self.header.slots_used += 1;
        } else if prev >= n {
            prev = 0;
        }

        if n == 1 {
            self.header.begin_timestamp = store_timestamp;
            self.header.begin_physical_offset = physical_offset;
        }
        let time_diff = ((store_timestamp - self.header.begin_timestamp) / 1000).max(0) as u32;

        let pos = self.entry_pos(n);
        let mut entry = &mut self.mmap[pos..pos + ENTRY_SIZE];
        entry.put_u32(key_hash);
        entry.put_u64(physical_offset);
        entry.put_u32(time_diff);
        entry.put_u32(prev);
        (&mut self.mmap[slot_pos..slot_pos + SLOT_SIZE]).put_u32(n);

        self.header.index_count = n + 1;
        self.header.end_timestamp = self.header.end_timestamp.max(store_timestamp);
        self.write_header();
        true
    }

    /// Record that everything below `physical_end` has been absorbed.
    pub fn set_end(&mut self, physical_end: u64, store_timestamp: i64) {
        self.header.end_physical_offset = self.header.end_physical_offset.max(physical_end);
        self.header.end_timestamp = self.header.end_timestamp.max(store_timestamp);
        self.write_header();
    }

    fn clamp_end(&mut self, physical_end: u64) {
        if self.header.end_physical_offset > physical_end {
            self.header.end_physical_offset = physical_end;
            self.write_header();
        }
    }

    /// Offsets of entries for `key_hash` stored within `[begin, end]` (ms),
    /// newest first.
    pub fn query(&self, key_hash: u32, begin: i64, end: i64, max: usize, out: &mut Vec<u64>) {
        let slot_pos = self.slot_pos(key_hash);
        let mut cur = (&self.mmap[slot_pos..slot_pos + SLOT_SIZE]).get_u32();
        while cur != 0 && cur < self.header.index_count && out.len() < max {
            let pos = self.entry_pos(cur);
            let mut entry = &self.mmap[pos..pos + ENTRY_SIZE];
            let hash = entry.get_u32();
            let physical_offset = entry.get_u64();
            let time_diff = entry.get_u32();
            let prev = entry.get_u32();

            // second granularity: accept anything inside the same second
            let stored_at = self.header.begin_timestamp + time_diff as i64 * 1000;
            if hash == key_hash && stored_at <= end && stored_at + 1000 > begin {
                out.push(physical_offset);
            }
            if prev >= cur {
                break;
            }
            cur = prev;
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Rolling set of index files fed by the dispatcher.
#[derive(Debug)]
pub struct IndexService {
    dir: PathBuf,
    slot_count: u32,
    max_entries: u32,
    files: RwLock<Vec<Arc<RwLock<IndexFile>>>>,
    dispatched_end: AtomicU64,
    last_timestamp: AtomicI64,
    write_lock: Mutex<()>,
}

impl IndexService {
    /// Load index files. After an unclean shutdown, files holding entries
    /// newer than `checkpoint_timestamp` are dropped and rebuilt by dispatch.
    pub fn load(config: &StoreConfig, clean: bool, checkpoint_timestamp: i64) -> Result<Self> {
        let dir = config.index_dir();
        std::fs::create_dir_all(&dir)?;

        let mut paths: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.len() == 20 && n.bytes().all(|b| b.is_ascii_digit()))
            })
            .collect();
        paths.sort();

        let mut files = Vec::new();
        for path in paths {
            let file = IndexFile::open(&path, config.index_slot_count, config.index_max_entries)?;
            if !clean && file.end_timestamp() > checkpoint_timestamp {
                warn!(
                    path = %path.display(),
                    end_timestamp = file.end_timestamp(),
                    checkpoint_timestamp,
                    "Dropping index file newer than checkpoint"
                );
                file.destroy()?;
                continue;
            }
            files.push(Arc::new(RwLock::new(file)));
        }

        let (end, ts) = files
            .last()
            .map(|f| {
                let f = f.read();
                (f.end_physical_offset(), f.end_timestamp())
            })
            .unwrap_or((0, 0));
        info!(files = files.len(), end, "Loaded index files");

        Ok(Self {
            dir,
            slot_count: config.index_slot_count,
            max_entries: config.index_max_entries,
            files: RwLock::new(files),
            dispatched_end: AtomicU64::new(end),
            last_timestamp: AtomicI64::new(ts),
            write_lock: Mutex::new(()),
        })
    }

    fn roll(&self) -> Result<Arc<RwLock<IndexFile>>> {
        let mut name = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut files = self.files.write();
        if let Some(last) = files.last() {
            let last_name = last
                .read()
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0);
            name = name.max(last_name + 1);
        }
        let path = self.dir.join(format!("{:020}", name));
        let file = Arc::new(RwLock::new(IndexFile::create(
            &path,
            self.slot_count,
            self.max_entries,
        )?));
        debug!(path = %path.display(), "Created index file");
        files.push(file.clone());
        Ok(file)
    }

    fn writable(&self) -> Result<Arc<RwLock<IndexFile>>> {
        let newest = self.files.read().last().cloned();
        match newest {
            Some(file) if !file.read().is_full() => Ok(file),
            _ => self.roll(),
        }
    }

    /// Index `key` for the record at `physical_offset`.
    pub fn put_key(&self, topic: &str, key: &str, physical_offset: u64, store_timestamp: i64) -> Result<()> {
        let key_hash = index_key_hash(topic, key);
        let file = self.writable()?;
        if file.write().put(key_hash, physical_offset, store_timestamp) {
            return Ok(());
        }
        let file = self.roll()?;
        let mut guard = file.write();
        if !guard.put(key_hash, physical_offset, store_timestamp) {
            return Err(Error::Other("fresh index file rejected a key".into()));
        }
        Ok(())
    }

    /// Candidate offsets for `topic#key` stored within `[begin, end]` (ms),
    /// newest first. Hash collisions are possible; callers verify the record.
    pub fn query(&self, topic: &str, key: &str, max: usize, begin: i64, end: i64) -> Vec<u64> {
        let key_hash = index_key_hash(topic, key);
        let files: Vec<_> = self.files.read().iter().rev().cloned().collect();
        let mut out = Vec::new();
        for file in files {
            if out.len() >= max {
                break;
            }
            let file = file.read();
            if file.entry_count() == 0 {
                continue;
            }
            if file.end_timestamp() + 1000 <= begin || file.begin_timestamp() > end {
                continue;
            }
            file.query(key_hash, begin, end, max, &mut out);
        }
        out
    }

    /// Lower the absorbed horizon after commit log truncation.
    pub fn clamp_end(&self, physical_end: u64) {
        let _guard = self.write_lock.lock();
        if let Some(file) = self.files.read().last() {
            file.write().clamp_end(physical_end);
        }
        self.dispatched_end.fetch_min(physical_end, Ordering::AcqRel);
    }

    /// Delete files, never the newest, whose entries all precede `physical_min`.
    pub fn delete_below(&self, physical_min: u64) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut files = self.files.write();
        let mut deleted = 0;
        while files.len() > 1 {
            let expired = files[0].read().end_physical_offset() <= physical_min;
            if !expired {
                break;
            }
            files[0].read().destroy()?;
            files.remove(0);
            deleted += 1;
        }
        if deleted > 0 {
            info!(deleted, physical_min, "Deleted expired index files");
        }
        Ok(deleted)
    }

    pub fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut files = self.files.write();
        for file in files.drain(..) {
            file.read().destroy()?;
        }
        self.dispatched_end.store(0, Ordering::Release);
        self.last_timestamp.store(0, Ordering::Release);
        Ok(())
    }

    /// Commit log offset below which every record has been indexed
    pub fn dispatched_end(&self) -> u64 {
        self.dispatched_end.load(Ordering::Acquire)
    }

    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }
}

impl DispatchSink for IndexService {
    fn name(&self) -> &'static str {
        "index"
    }

    fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        let _guard = self.write_lock.lock();
        if request.physical_offset < self.dispatched_end() {
            return Ok(());
        }
        for key in &request.keys {
            self.put_key(
                &request.topic,
                key,
                request.physical_offset,
                request.store_timestamp,
            )?;
        }
        if let Some(file) = self.files.read().last() {
            file.write()
                .set_end(request.end_offset(), request.store_timestamp);
        }
        self.dispatched_end
            .fetch_max(request.end_offset(), Ordering::AcqRel);
        self.last_timestamp
            .fetch_max(request.store_timestamp, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let files: Vec<_> = self.files.read().iter().rev().take(2).cloned().collect();
        for file in files {
            file.read().flush()?;
        }
        Ok(())
    }
}
