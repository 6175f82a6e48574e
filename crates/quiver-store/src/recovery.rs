//! Startup: lock the root, decide whether the last shutdown was clean,
//! trim the commit log to its valid end and bring the derived structures
//! back in line with it.

use crate::checkpoint::StoreCheckpoint;
use crate::config::StoreConfig;
use crate::dispatcher::{DispatchSink, Dispatcher};
use crate::storage::{CommitLog, ConsumeQueueTable, IndexService, ScanStep};
use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::sync::Arc;
use tracing::{info, warn};

/// Exclusive hold on a store root, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    pub fn acquire(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir)?;
        let path = config.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            Error::StoreLocked(format!("{} ({})", path.display(), e))
        })?;
        Ok(Self { file })
    }

    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

/// Everything recovery hands to the running store.
#[derive(Debug)]
pub struct Recovered {
    pub lock: StoreLock,
    pub commit_log: Arc<CommitLog>,
    pub consume_queues: Arc<ConsumeQueueTable>,
    pub index: Arc<IndexService>,
    pub dispatcher: Arc<Dispatcher>,
    pub checkpoint: StoreCheckpoint,
    /// Whether the previous shutdown was clean
    pub clean: bool,
}

/// Open and recover the store under `config.root_dir`. Blocking.
pub fn recover(config: &StoreConfig) -> Result<Recovered> {
    config.validate()?;
    let lock = StoreLock::acquire(config)?;

    let abort_path = config.abort_path();
    let previous = StoreCheckpoint::load(&config.checkpoint_path())?;
    let clean = !abort_path.exists() && previous.is_some();
    File::create(&abort_path)?.sync_all()?;
    let previous = previous.unwrap_or_default();

    let commit_log = Arc::new(CommitLog::open(config)?);
    let consume_queues = Arc::new(ConsumeQueueTable::load(config)?);
    let index = Arc::new(IndexService::load(config, clean, previous.index_timestamp)?);

    let bases = commit_log.segment_bases();
    if !clean && !bases.is_empty() {
        warn!(root = %config.root_dir.display(), "Previous shutdown was not clean, rescanning commit log");
    }

    let scan_from = match bases.first() {
        None => previous.commit_log_flushed,
        Some(&oldest) if clean => commit_log
            .segment_base_for(previous.commit_log_flushed)
            .max(oldest),
        Some(&oldest) => oldest,
    };
    let end = scan_valid_end(&commit_log, scan_from);
    let discarded = commit_log.max_offset().saturating_sub(end);
    commit_log.set_recovered_end(end)?;

    consume_queues.truncate_dirty(end)?;
    index.clamp_end(end);

    let dispatcher = Arc::new(Dispatcher::new(
        commit_log.clone(),
        vec![
            consume_queues.clone() as Arc<dyn DispatchSink>,
            index.clone() as Arc<dyn DispatchSink>,
        ],
    ));

    let derived_end = if clean {
        consume_queues.max_physical_end().max(index.dispatched_end())
    } else {
        consume_queues
            .min_physical_end()
            .unwrap_or(end)
            .min(index.dispatched_end())
    };
    let replay_from = derived_end.clamp(commit_log.min_offset(), end);
    let reached = dispatcher.dispatch_range(replay_from, end)?;
    if reached != end {
        return Err(Error::corrupted(reached, "recovery replay stopped short of log end"));
    }
    commit_log.mark_dispatched(end);
    commit_log.set_queue_offsets(consume_queues.queue_offset_table());

    dispatcher.flush_sinks()?;
    let checkpoint = StoreCheckpoint {
        commit_log_flushed: end,
        consume_queue_timestamp: consume_queues
            .last_timestamp()
            .max(previous.consume_queue_timestamp),
        index_timestamp: index.last_timestamp().max(previous.index_timestamp),
    };
    checkpoint.save(&config.checkpoint_path())?;

    info!(
        clean,
        min_offset = commit_log.min_offset(),
        end,
        discarded,
        replayed = end - replay_from,
        queues = consume_queues.len(),
        "Store recovered"
    );

    Ok(Recovered {
        lock,
        commit_log,
        consume_queues,
        index,
        dispatcher,
        checkpoint,
        clean,
    })
}

/// Walk valid records from `from`; the first position that does not hold
/// one is the end of valid data.
fn scan_valid_end(commit_log: &CommitLog, from: u64) -> u64 {
    let mut cur = from;
    while let Some(step) = commit_log.probe(cur) {
        cur = match step {
            ScanStep::Record(record) => record.end_offset(),
            ScanStep::Blank { next } => next,
            ScanStep::End => break,
        };
    }
    cur
}
