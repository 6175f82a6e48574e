//! # Quiver Cluster
//!
//! Distribution for the Quiver message store:
//! - **HA Replication**: a backup tails the primary's commit log byte for
//!   byte and acknowledges what it holds
//! - **Queue Allocation**: consistent-hash assignment of queues to the
//!   consumers of a group
//! - **Offset Store**: consumer-side progress in a local file
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   report(max offset)   ┌──────────────────────┐
//! │      HaPrimary       │ ◄───────────────────── │       HaBackup       │
//! │  MessageStore (rw)   │ ─────────────────────► │  MessageStore (ro)   │
//! │                      │  DATA / HEARTBEAT/GAP  │  dispatch + replay   │
//! └──────────────────────┘                        └──────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use quiver_cluster::{HaBackup, HaConfig, HaPrimary};
//! use quiver_store::{MessageStore, StoreConfig, StoreRole};
//!
//! let primary_store = MessageStore::open(
//!     StoreConfig::new("/data/a").with_role(StoreRole::SyncPrimary),
//! ).await?;
//! let primary = HaPrimary::start(primary_store, HaConfig::primary(listen)).await?;
//!
//! let backup_store = MessageStore::open(
//!     StoreConfig::new("/data/b").with_role(StoreRole::Backup),
//! ).await?;
//! let backup = HaBackup::start(backup_store, HaConfig::backup(primary.local_addr()))?;
//! ```

pub mod allocation;
pub mod config;
pub mod error;
pub mod offset_store;
pub mod protocol;
pub mod replication;

pub use allocation::{AllocationStrategy, ConsistentHashAllocator, MessageQueue};
pub use config::HaConfig;
pub use error::{AllocationError, ClusterError, Result};
pub use offset_store::{LocalOffsetStore, ReadOffset, ReadOffsetType};
pub use protocol::{Frame, FrameKind};
pub use replication::{
    BackupConnection, BackupState, BackupStatus, HaBackup, HaPrimary, PrimaryConnState,
};
