//! Quiver message store.
//!
//! An append-only commit log of mapped segment files, per-queue consume
//! queues and a key index derived from it by an ordered dispatcher, plus
//! checkpointed crash recovery.

pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod hash;
pub mod message;
pub mod recovery;
pub mod storage;
pub mod store;

pub use checkpoint::StoreCheckpoint;
pub use config::{FlushMode, StoreConfig, StoreRole};
pub use dispatcher::{DispatchRequest, DispatchSink, Dispatcher};
pub use error::{Error, Result};
pub use error::Error as StoreError;
pub use filter::{MessageFilter, TagFilter};
pub use message::{NewMessage, StoredRecord};
pub use storage::{AppendResult, CommitLog, ConsumeQueueTable, IndexService};
pub use store::{
    GetMessageResult, GetMessageStatus, MessageStore, PutMessageResult, PutStatus, ReplicaAck,
    StoreStatsSnapshot,
};
