//! Durable record of how far the store is known to be consistent.
//!
//! Layout (big-endian): commit log flushed offset `u64`, consume queue
//! timestamp `i64`, index timestamp `i64`, crc32 of the preceding 24 bytes.

use crate::Result;
use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const CHECKPOINT_BODY: usize = 24;
pub const CHECKPOINT_SIZE: usize = CHECKPOINT_BODY + 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCheckpoint {
    pub commit_log_flushed: u64,
    /// Store timestamp of the newest entry the consume queues hold durably
    pub consume_queue_timestamp: i64,
    /// Store timestamp of the newest entry the index files hold durably
    pub index_timestamp: i64,
}

impl StoreCheckpoint {
    /// Earliest timestamp at which every derived structure was durable
    pub fn min_timestamp(&self) -> i64 {
        self.consume_queue_timestamp.min(self.index_timestamp)
    }

    fn encode(&self) -> [u8; CHECKPOINT_SIZE] {
        let mut buf = BytesMut::with_capacity(CHECKPOINT_SIZE);
        buf.put_u64(self.commit_log_flushed);
        buf.put_i64(self.consume_queue_timestamp);
        buf.put_i64(self.index_timestamp);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);

        let mut out = [0u8; CHECKPOINT_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != CHECKPOINT_SIZE {
            return None;
        }
        let (body, mut crc) = raw.split_at(CHECKPOINT_BODY);
        if crc32fast::hash(body) != crc.get_u32() {
            return None;
        }
        let mut body = body;
        Some(Self {
            commit_log_flushed: body.get_u64(),
            consume_queue_timestamp: body.get_i64(),
            index_timestamp: body.get_i64(),
        })
    }

    /// Read the checkpoint. A missing or damaged file yields `None`, which
    /// recovery treats as an unclean start.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Self::decode(&raw) {
            Some(checkpoint) => {
                debug!(?checkpoint, "Loaded store checkpoint");
                Ok(Some(checkpoint))
            }
            None => {
                warn!(path = %path.display(), len = raw.len(), "Ignoring damaged checkpoint");
                Ok(None)
            }
        }
    }

    /// Write through a temp file, fsync, then rename over the old checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.encode())?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Err(e) = sync_parent(path) {
            warn!(path = %path.display(), error = %e, "Checkpoint directory fsync failed");
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
