//! Consumer-side offset store backed by a local JSON file
//!
//! Offsets live in memory and are written out on `persist_all`. The file is
//! replaced atomically (temp file, fsync, rename) and the previous version
//! is kept next to it as `<file>.bak`, which reads fall back to when the
//! main file is missing or damaged.

use crate::allocation::MessageQueue;
use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where `read_offset` looks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffsetType {
    Memory,
    Store,
    MemoryThenStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOffset {
    Found(u64),
    NotFound,
    /// Neither the file nor its backup could be read
    ReadError(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OffsetFile {
    offsets: Vec<QueueOffset>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueOffset {
    queue: MessageQueue,
    offset: u64,
}

/// Local offset store for one consumer group
#[derive(Debug)]
pub struct LocalOffsetStore {
    path: PathBuf,
    offsets: RwLock<HashMap<MessageQueue, u64>>,
}

impl LocalOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load persisted offsets into memory. A missing file is not an error.
    pub fn load(&self) -> Result<()> {
        let Some(file) = self.read_file()? else {
            return Ok(());
        };
        let mut offsets = self.offsets.write();
        for entry in file.offsets {
            offsets.insert(entry.queue, entry.offset);
        }
        debug!(path = %self.path.display(), queues = offsets.len(), "Loaded consumer offsets");
        Ok(())
    }

    /// Record `offset` for `queue`. With `increase_only` a smaller offset
    /// than the one held is ignored.
    pub fn update_offset(&self, queue: &MessageQueue, offset: u64, increase_only: bool) {
        let mut offsets = self.offsets.write();
        let current = offsets.entry(queue.clone()).or_insert(offset);
        if !increase_only || offset > *current {
            *current = offset;
        }
    }

    pub fn read_offset(&self, queue: &MessageQueue, read_type: ReadOffsetType) -> ReadOffset {
        if read_type != ReadOffsetType::Store {
            if let Some(offset) = self.offsets.read().get(queue) {
                return ReadOffset::Found(*offset);
            }
            if read_type == ReadOffsetType::Memory {
                return ReadOffset::NotFound;
            }
        }

        match self.read_file() {
            Ok(Some(file)) => {
                match file.offsets.into_iter().find(|e| &e.queue == queue) {
                    Some(entry) => {
                        self.update_offset(queue, entry.offset, false);
                        ReadOffset::Found(entry.offset)
                    }
                    None => ReadOffset::NotFound,
                }
            }
            Ok(None) => ReadOffset::NotFound,
            Err(e) => ReadOffset::ReadError(e.to_string()),
        }
    }

    /// Write the offsets of `queues` held in memory to the file.
    pub fn persist_all(&self, queues: &[MessageQueue]) -> Result<()> {
        if queues.is_empty() {
            return Ok(());
        }
        let file = {
            let offsets = self.offsets.read();
            let mut entries: Vec<QueueOffset> = queues
                .iter()
                .filter_map(|queue| {
                    offsets.get(queue).map(|offset| QueueOffset {
                        queue: queue.clone(),
                        offset: *offset,
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.queue.cmp(&b.queue));
            entries.dedup_by(|a, b| a.queue == b.queue);
            OffsetFile { offsets: entries }
        };
        let json = serde_json::to_string_pretty(&file)?;
        self.write_atomically(json.as_bytes())?;
        debug!(path = %self.path.display(), queues = file.offsets.len(), "Persisted consumer offsets");
        Ok(())
    }

    pub fn remove_offset(&self, queue: &MessageQueue) {
        if self.offsets.write().remove(queue).is_some() {
            debug!(queue = %queue, "Removed consumer offset");
        }
    }

    /// In-memory offsets of every queue of `topic`
    pub fn clone_offset_table(&self, topic: &str) -> HashMap<MessageQueue, u64> {
        self.offsets
            .read()
            .iter()
            .filter(|(queue, _)| queue.topic == topic)
            .map(|(queue, offset)| (queue.clone(), *offset))
            .collect()
    }

    /// Main file, else the backup. `None` when neither exists.
    fn read_file(&self) -> Result<Option<OffsetFile>> {
        let main = match read_json(&self.path) {
            Ok(Some(file)) => return Ok(Some(file)),
            Ok(None) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Offset file unreadable, trying backup");
                Some(e)
            }
        };
        match (read_json(&self.backup_path()), main) {
            (Ok(Some(file)), _) => Ok(Some(file)),
            (Ok(None), None) => Ok(None),
            (Ok(None), Some(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    fn write_atomically(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.temp_path();
        fs::write(&tmp, data)?;
        fs::File::open(&tmp)?.sync_all()?;

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Err(e) = sync_parent(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Offset directory fsync failed");
        }
        Ok(())
    }
}

/// Fsync the directory holding `path` so a rename into it is durable.
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

fn read_json(path: &Path) -> Result<Option<OffsetFile>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue(id: u32) -> MessageQueue {
        MessageQueue::new("orders", "broker-a", id)
    }

    #[test]
    fn test_unknown_queue_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalOffsetStore::new(dir.path().join("offsets.json"));
        store.load().unwrap();
        for read_type in [
            ReadOffsetType::Memory,
            ReadOffsetType::Store,
            ReadOffsetType::MemoryThenStore,
        ] {
            assert_eq!(store.read_offset(&queue(0), read_type), ReadOffset::NotFound);
        }
    }

    #[test]
    fn test_increase_only() {
        let dir = TempDir::new().unwrap();
        let store = LocalOffsetStore::new(dir.path().join("offsets.json"));
        store.update_offset(&queue(0), 10, true);
        store.update_offset(&queue(0), 5, true);
        assert_eq!(
            store.read_offset(&queue(0), ReadOffsetType::Memory),
            ReadOffset::Found(10)
        );
        store.update_offset(&queue(0), 5, false);
        assert_eq!(
            store.read_offset(&queue(0), ReadOffsetType::Memory),
            ReadOffset::Found(5)
        );
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group").join("offsets.json");
        let store = LocalOffsetStore::new(&path);
        store.update_offset(&queue(0), 42, false);
        store.update_offset(&queue(1), 7, false);
        store.update_offset(&MessageQueue::new("audit", "broker-a", 0), 3, false);
        store
            .persist_all(&[queue(0), queue(1), queue(2)])
            .unwrap();

        let reloaded = LocalOffsetStore::new(&path);
        assert_eq!(
            reloaded.read_offset(&queue(1), ReadOffsetType::MemoryThenStore),
            ReadOffset::Found(7)
        );
        reloaded.load().unwrap();
        let table = reloaded.clone_offset_table("orders");
        assert_eq!(table.len(), 2);
        assert_eq!(table[&queue(0)], 42);
        assert_eq!(
            reloaded.read_offset(&MessageQueue::new("audit", "broker-a", 0), ReadOffsetType::Store),
            ReadOffset::NotFound
        );
    }

    #[test]
    fn test_backup_fallback_on_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        let store = LocalOffsetStore::new(&path);
        store.update_offset(&queue(0), 100, false);
        store.persist_all(&[queue(0)]).unwrap();
        store.update_offset(&queue(0), 200, false);
        store.persist_all(&[queue(0)]).unwrap();

        fs::write(&path, b"{ not json").unwrap();
        let reloaded = LocalOffsetStore::new(&path);
        assert_eq!(
            reloaded.read_offset(&queue(0), ReadOffsetType::Store),
            ReadOffset::Found(100)
        );
    }

    #[test]
    fn test_read_error_without_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        fs::write(&path, b"garbage").unwrap();
        let store = LocalOffsetStore::new(&path);
        assert!(matches!(
            store.read_offset(&queue(0), ReadOffsetType::Store),
            ReadOffset::ReadError(_)
        ));
        assert!(store.load().is_err());
    }

    #[test]
    fn test_sync_parent() {
        let dir = TempDir::new().unwrap();
        assert!(sync_parent(&dir.path().join("offsets.json")).is_ok());
        assert!(sync_parent(Path::new("offsets.json")).is_ok());
        assert!(sync_parent(&dir.path().join("missing").join("offsets.json")).is_err());
    }

    #[test]
    fn test_remove_offset() {
        let dir = TempDir::new().unwrap();
        let store = LocalOffsetStore::new(dir.path().join("offsets.json"));
        store.update_offset(&queue(3), 9, false);
        store.remove_offset(&queue(3));
        assert_eq!(
            store.read_offset(&queue(3), ReadOffsetType::Memory),
            ReadOffset::NotFound
        );
    }
}
