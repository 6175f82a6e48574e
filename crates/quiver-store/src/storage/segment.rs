use crate::{Error, Result};
use bytes::Bytes;
use memmap2::MmapRaw;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Fixed-size, pre-allocated, memory-mapped file addressed by a base offset.
///
/// Three pointers track progress through the file:
/// - `write`: end of the bytes appended so far
/// - `flushed`: end of the bytes known to be on disk
/// - `committed`: end of the bytes whose derived entries are published
///
/// `write >= flushed >= committed` always holds. Appends require the owner to
/// serialize writers; reads are lock-free and never go past `write`.
#[derive(Debug)]
pub struct MappedSegment {
    path: PathBuf,
    base_offset: u64,
    capacity: u64,
    file: File,
    mmap: MmapRaw,
    write_pos: AtomicU64,
    flushed_pos: AtomicU64,
    committed_pos: AtomicU64,
    degraded: AtomicBool,
}

impl MappedSegment {
    pub fn file_name(base_offset: u64) -> String {
        format!("{:020}", base_offset)
    }

    /// Parse a segment file name back into its base offset.
    pub fn parse_file_name(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        if name.len() != 20 {
            return None;
        }
        name.parse().ok()
    }

    /// Create a new, empty segment file.
    pub fn create(dir: &Path, base_offset: u64, capacity: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(base_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(capacity)?;
        debug!(path = %path.display(), base_offset, capacity, "Created segment");
        Self::map(path, file, base_offset, capacity, 0)
    }

    /// Open an existing segment. All pointers start at `capacity`; recovery
    /// moves them back to the end of valid data with [`Self::set_positions`].
    pub fn open(path: &Path, capacity: u64) -> Result<Self> {
        let base_offset = Self::parse_file_name(path).ok_or_else(|| {
            Error::Other(format!("Not a segment file: {}", path.display()))
        })?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != capacity {
            warn!(
                path = %path.display(),
                len,
                capacity,
                "Segment file size differs from configured capacity, resizing"
            );
            file.set_len(capacity)?;
        }
        Self::map(path.to_path_buf(), file, base_offset, capacity, capacity)
    }

    fn map(path: PathBuf, file: File, base_offset: u64, capacity: u64, pos: u64) -> Result<Self> {
        let mmap = MmapRaw::map_raw(&file)?;
        Ok(Self {
            path,
            base_offset,
            capacity,
            file,
            mmap,
            write_pos: AtomicU64::new(pos),
            flushed_pos: AtomicU64::new(pos),
            committed_pos: AtomicU64::new(pos),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Absolute offset one past the end of this file
    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.capacity
    }

    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> u64 {
        self.flushed_pos.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> u64 {
        self.committed_pos.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.write_position()
    }

    pub fn is_full(&self) -> bool {
        self.write_position() >= self.capacity
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.end_offset()
    }

    /// Append bytes at the write pointer, returning the relative position
    /// they were written at. Callers must serialize appends.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let pos = self.write_position();
        self.write_at(pos, data)?;
        self.write_pos.store(pos + data.len() as u64, Ordering::Release);
        Ok(pos)
    }

    /// Write `marker` at the write pointer and mark the rest of the file used.
    pub fn append_filler(&self, marker: &[u8]) -> Result<u64> {
        let pos = self.write_position();
        self.write_at(pos, marker)?;
        self.write_pos.store(self.capacity, Ordering::Release);
        Ok(pos)
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        if end > self.capacity {
            return Err(Error::Other(format!(
                "Write of {} bytes at {} overflows segment {} (capacity {})",
                data.len(),
                pos,
                self.base_offset,
                self.capacity
            )));
        }
        // SAFETY: `pos..end` lies inside the mapping (checked above). The owner
        // serializes writers, and readers only observe bytes below the write
        // pointer, which is published with Release after this copy completes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mmap.as_mut_ptr().add(pos as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Borrow `len` bytes at relative position `pos`, bounded by the write pointer.
    pub fn slice(&self, pos: u64, len: usize) -> Option<&[u8]> {
        let end = pos.checked_add(len as u64)?;
        if end > self.write_position() {
            return None;
        }
        // SAFETY: `pos..end` is below the write pointer (Acquire load above), so
        // those bytes were fully written before being published and are never
        // modified again except by recovery truncation, which runs before
        // readers exist.
        Some(unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(pos as usize), len) })
    }

    /// Copy `len` bytes at relative position `pos`.
    pub fn read(&self, pos: u64, len: usize) -> Result<Bytes> {
        if self.is_degraded() {
            return Err(Error::SegmentDegraded(self.base_offset));
        }
        self.slice(pos, len)
            .map(Bytes::copy_from_slice)
            .ok_or(Error::OffsetOutOfRange(self.base_offset + pos))
    }

    /// msync everything between the flushed and write pointers.
    pub fn flush(&self) -> Result<u64> {
        let write = self.write_position();
        let flushed = self.flushed_position();
        if write > flushed {
            self.mmap
                .flush_range(flushed as usize, (write - flushed) as usize)?;
            self.flushed_pos.fetch_max(write, Ordering::AcqRel);
        }
        Ok(self.flushed_position())
    }

    pub fn set_committed(&self, pos: u64) {
        let pos = pos.min(self.flushed_position());
        self.committed_pos.fetch_max(pos, Ordering::AcqRel);
    }

    /// Reset all pointers to `pos` (recovery).
    pub fn set_positions(&self, pos: u64) {
        let pos = pos.min(self.capacity);
        self.write_pos.store(pos, Ordering::Release);
        self.flushed_pos.store(pos, Ordering::Release);
        self.committed_pos.store(pos, Ordering::Release);
    }

    /// Discard everything from `pos` on, zeroing the discarded bytes.
    pub fn truncate_to(&self, pos: u64) -> Result<()> {
        let pos = pos.min(self.capacity);
        let len = (self.capacity - pos) as usize;
        if len > 0 {
            // SAFETY: `pos..capacity` lies inside the mapping. Truncation only
            // runs while the owner holds its writer lock and no reader is past
            // `pos` (the pointers are lowered before returning).
            unsafe {
                std::ptr::write_bytes(self.mmap.as_mut_ptr().add(pos as usize), 0, len);
            }
            self.mmap.flush_range(pos as usize, len)?;
        }
        self.set_positions(pos);
        Ok(())
    }

    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(path = %self.path.display(), "Segment marked degraded");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn last_modified(&self) -> Result<SystemTime> {
        Ok(self.file.metadata()?.modified()?)
    }

    /// Delete the backing file. The mapping stays valid until the last
    /// handle is dropped, so in-flight readers finish safely.
    pub fn destroy(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "Deleted segment");
        Ok(())
    }
}

/// List segment files in `dir`, sorted by base offset.
pub fn list_segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && MappedSegment::parse_file_name(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(dir.path(), 4096, 1024).unwrap();
        assert_eq!(seg.append(b"hello").unwrap(), 0);
        assert_eq!(seg.append(b"world").unwrap(), 5);
        assert_eq!(seg.write_position(), 10);
        assert_eq!(seg.read(5, 5).unwrap().as_ref(), b"world");
        assert!(seg.read(8, 5).is_err());
        assert!(seg.path().ends_with("00000000000000004096"));
    }

    #[test]
    fn test_pointer_ordering() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(dir.path(), 0, 1024).unwrap();
        seg.append(&[1u8; 100]).unwrap();
        seg.set_committed(100);
        assert_eq!(seg.committed_position(), 0);
        assert_eq!(seg.flush().unwrap(), 100);
        seg.set_committed(100);
        assert_eq!(seg.committed_position(), 100);
        assert!(seg.write_position() >= seg.flushed_position());
        assert!(seg.flushed_position() >= seg.committed_position());
    }

    #[test]
    fn test_overflow_rejected() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(dir.path(), 0, 16).unwrap();
        seg.append(&[0u8; 10]).unwrap();
        assert!(seg.append(&[0u8; 10]).is_err());
        assert_eq!(seg.write_position(), 10);
    }

    #[test]
    fn test_truncate_zeroes_tail() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(dir.path(), 0, 64).unwrap();
        seg.append(&[7u8; 32]).unwrap();
        seg.truncate_to(16).unwrap();
        assert_eq!(seg.write_position(), 16);
        seg.set_positions(32);
        assert_eq!(seg.read(16, 16).unwrap().as_ref(), &[0u8; 16]);
    }

    #[test]
    fn test_reopen_and_list() {
        let dir = TempDir::new().unwrap();
        {
            let seg = MappedSegment::create(dir.path(), 128, 64).unwrap();
            seg.append(b"abc").unwrap();
            seg.flush().unwrap();
            MappedSegment::create(dir.path(), 0, 64).unwrap();
        }
        std::fs::write(dir.path().join("not-a-segment"), b"x").unwrap();

        let files = list_segment_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        let reopened = MappedSegment::open(&files[1], 64).unwrap();
        assert_eq!(reopened.base_offset(), 128);
        assert!(reopened.is_full());
        reopened.set_positions(3);
        assert_eq!(reopened.read(0, 3).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_degraded_reads_fail_fast() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(dir.path(), 0, 64).unwrap();
        seg.append(b"abc").unwrap();
        seg.mark_degraded();
        assert!(matches!(seg.read(0, 3), Err(Error::SegmentDegraded(0))));
    }
}
