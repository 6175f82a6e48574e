use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("Segment {0} is degraded after a corrupted read")]
    SegmentDegraded(u64),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error("Consume queue {topic}/{queue_id} expected entry {expected}, got {actual}")]
    QueueGap {
        topic: String,
        queue_id: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Append at {actual} does not continue log end {expected}")]
    NonContiguousAppend { expected: u64, actual: u64 },

    #[error("Store directory is locked by another process: {0}")]
    StoreLocked(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Data on disk cannot be trusted; the caller should stop serving it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupted { .. } | Error::SegmentDegraded(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(Error::corrupted(42, "bad crc").is_fatal());
        assert!(Error::SegmentDegraded(0).is_fatal());
        assert!(!Error::ShuttingDown.is_fatal());
        assert!(!Error::MessageTooLarge { size: 10, max: 5 }.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::corrupted(128, "magic mismatch");
        assert_eq!(
            err.to_string(),
            "Corrupted record at offset 128: magic mismatch"
        );
    }
}
