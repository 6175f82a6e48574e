pub mod commit_log;
pub mod consume_queue;
pub mod index;
pub mod segment;

pub use commit_log::{AppendResult, CommitLog, QueueOffsetTable, ScanStep};
pub use consume_queue::{ConsumeQueue, ConsumeQueueTable, CqEntry, CQ_ENTRY_SIZE};
pub use index::{IndexFile, IndexService};
pub use segment::MappedSegment;
