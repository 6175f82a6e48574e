//! Primary/backup commit log replication
//!
//! A backup connects to its primary and reports the max offset of its own
//! commit log. The primary streams raw commit log bytes from that offset,
//! one segment at a time, and the backup appends them verbatim so both logs
//! are byte-identical. Every report doubles as an acknowledgement, which is
//! what a sync primary waits on before confirming a write.
//!
//! Primary connection: Connecting -> Transferring -> Disconnected.
//! Backup: Connecting -> Handshaking -> Syncing -> Disconnected.

use crate::config::HaConfig;
use crate::error::{ClusterError, Result};
use crate::protocol::{read_frame, read_report, write_frame, write_report, Frame, FrameKind};
use async_trait::async_trait;
use dashmap::DashMap;
use quiver_store::{MessageStore, ReplicaAck};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Highest offset any backup has acknowledged.
#[derive(Debug)]
struct AckTracker {
    acked: watch::Sender<u64>,
    transferring: AtomicUsize,
}

impl AckTracker {
    fn record(&self, offset: u64) {
        self.acked.send_if_modified(|acked| {
            if offset > *acked {
                *acked = offset;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl ReplicaAck for AckTracker {
    fn has_replica(&self) -> bool {
        self.transferring.load(Ordering::Acquire) > 0
    }

    async fn wait_for_ack(&self, offset: u64, wait: Duration) -> bool {
        let mut acked = self.acked.subscribe();
        let waited = timeout(wait, acked.wait_for(|a| *a >= offset)).await;
        matches!(waited, Ok(Ok(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryConnState {
    Connecting,
    Transferring,
    Disconnected,
}

/// One backup as seen by the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConnection {
    pub id: u64,
    pub addr: SocketAddr,
    pub state: PrimaryConnState,
    /// Last offset this backup reported
    pub acked_offset: u64,
}

struct PrimaryShared {
    store: Arc<MessageStore>,
    config: HaConfig,
    tracker: Arc<AckTracker>,
    connections: DashMap<u64, BackupConnection>,
}

impl PrimaryShared {
    fn set_state(&self, id: u64, state: PrimaryConnState) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            if conn.state != PrimaryConnState::Transferring && state == PrimaryConnState::Transferring {
                self.tracker.transferring.fetch_add(1, Ordering::AcqRel);
            }
            conn.state = state;
        }
    }

    fn record_report(&self, id: u64, offset: u64) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.acked_offset = offset;
        }
        self.tracker.record(offset);
    }

    fn remove(&self, id: u64) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            if conn.state == PrimaryConnState::Transferring {
                self.tracker.transferring.fetch_sub(1, Ordering::AcqRel);
            }
            info!(
                backup = %conn.addr,
                acked = conn.acked_offset,
                state = ?PrimaryConnState::Disconnected,
                "Backup disconnected"
            );
        }
    }
}

/// Primary side: accepts backups and streams the commit log to them.
pub struct HaPrimary {
    shared: Arc<PrimaryShared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HaPrimary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaPrimary")
            .field("local_addr", &self.local_addr)
            .field("acked_offset", &self.acked_offset())
            .field("backups", &self.shared.connections.len())
            .finish()
    }
}

impl HaPrimary {
    /// Bind `config.listen_addr`, register as the store's replica
    /// acknowledger and start accepting backups.
    pub async fn start(store: Arc<MessageStore>, config: HaConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ClusterError::ConnectionFailed(format!("Failed to bind: {}", e)))?;
        let local_addr = listener.local_addr()?;

        let (acked, _) = watch::channel(0);
        let tracker = Arc::new(AckTracker {
            acked,
            transferring: AtomicUsize::new(0),
        });
        store.set_replica_ack(tracker.clone());

        let shared = Arc::new(PrimaryShared {
            store,
            config,
            tracker,
            connections: DashMap::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        info!(addr = %local_addr, "HA primary listening");
        Ok(Arc::new(Self {
            shared,
            local_addr,
            shutdown_tx,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Highest offset acknowledged by any backup
    pub fn acked_offset(&self) -> u64 {
        *self.shared.tracker.acked.borrow()
    }

    pub fn connected_backups(&self) -> Vec<BackupConnection> {
        let mut backups: Vec<_> = self
            .shared
            .connections
            .iter()
            .map(|c| c.value().clone())
            .collect();
        backups.sort_by_key(|c| c.id);
        backups
    }

    /// Wait until a backup acknowledges `offset`. False on timeout.
    pub async fn wait_for_ack(&self, offset: u64, wait: Duration) -> bool {
        self.shared.tracker.wait_for_ack(offset, wait).await
    }

    /// Stop accepting and close every backup connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "HA accept loop ended abnormally");
            }
        }
        info!(addr = %self.local_addr, "HA primary stopped");
    }
}

impl Drop for HaPrimary {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<PrimaryShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_id = AtomicU64::new(1);
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        shared.connections.insert(id, BackupConnection {
                            id,
                            addr,
                            state: PrimaryConnState::Connecting,
                            acked_offset: 0,
                        });
                        debug!(backup = %addr, id, "Accepted backup connection");

                        let shared = shared.clone();
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            if let Err(e) = serve_backup(&shared, id, stream, shutdown).await {
                                match e {
                                    ClusterError::ConnectionClosed => {}
                                    e => warn!(backup = %addr, error = %e, "Backup session ended"),
                                }
                            }
                            shared.remove(id);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown.changed() => {
                info!("HA primary shutting down");
                break;
            }
        }
    }
    while sessions.join_next().await.is_some() {}
}

async fn serve_backup(
    shared: &Arc<PrimaryShared>,
    id: u64,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = &shared.config;
    let store = &shared.store;
    let (mut reader, mut writer) = stream.into_split();

    let requested = timeout(config.idle_timeout, read_report(&mut reader)).await??;
    let min = store.min_physical_offset();
    let max = store.max_physical_offset();
    if requested < min && max > min {
        warn!(requested, min_available = min, "Backup is behind retained history");
        write_frame(&mut writer, &Frame::gap(min, max)).await?;
        return Err(ClusterError::UnrecoverableGap {
            requested,
            min_available: min,
        });
    }
    if requested > max {
        warn!(requested, primary_max = max, "Backup is ahead of this primary");
        write_frame(&mut writer, &Frame::ahead(max)).await?;
        return Err(ClusterError::BackupAhead {
            reported: requested,
            primary_max: max,
        });
    }

    shared.record_report(id, requested);
    shared.set_state(id, PrimaryConnState::Transferring);
    info!(id, from = requested, "Backup transferring");

    let mut reports = tokio::spawn(read_reports(shared.clone(), id, reader));
    let mut appends = store.subscribe_appends();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.reset();
    let mut next = requested;

    let result = loop {
        if let Err(e) = push_pending(shared, &mut writer, &mut next).await {
            break Err(e);
        }
        tokio::select! {
            changed = appends.changed() => {
                if changed.is_err() {
                    break Err(ClusterError::ShuttingDown);
                }
            }
            _ = heartbeat.tick() => {
                let frame = Frame::heartbeat(next, store.max_physical_offset());
                if let Err(e) = send(config, &mut writer, &frame).await {
                    break Err(e);
                }
            }
            ended = &mut reports => {
                break match ended {
                    Ok(result) => result,
                    Err(e) => Err(ClusterError::Protocol(format!("report reader failed: {}", e))),
                };
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };
    reports.abort();
    result
}

/// Send everything between `next` and the current end of the log.
async fn push_pending(
    shared: &PrimaryShared,
    writer: &mut OwnedWriteHalf,
    next: &mut u64,
) -> Result<()> {
    let store = &shared.store;
    loop {
        let max = store.max_physical_offset();
        if *next >= max {
            return Ok(());
        }
        let min = store.min_physical_offset();
        if *next < min {
            send(&shared.config, writer, &Frame::gap(min, max)).await?;
            return Err(ClusterError::UnrecoverableGap {
                requested: *next,
                min_available: min,
            });
        }
        let body = match store.transfer_slice(*next, shared.config.max_transfer_bytes)? {
            Some(body) => body,
            None => return Ok(()),
        };
        let len = body.len() as u64;
        send(&shared.config, writer, &Frame::data(*next, max, body)).await?;
        *next += len;
    }
}

async fn send(config: &HaConfig, writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    timeout(config.idle_timeout, write_frame(writer, frame)).await?
}

async fn read_reports(shared: Arc<PrimaryShared>, id: u64, mut reader: OwnedReadHalf) -> Result<()> {
    loop {
        let offset = timeout(shared.config.idle_timeout, read_report(&mut reader)).await??;
        shared.record_report(id, offset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Connecting,
    Handshaking,
    Syncing,
    Disconnected,
}

/// Observable replication status of a backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStatus {
    pub state: BackupState,
    /// Local commit log max offset
    pub local_max: u64,
    /// Primary max offset from the last frame
    pub primary_max: u64,
    pub last_error: Option<String>,
    /// Times the primary reported a gap
    pub gap_count: u64,
    /// Successful handshakes so far
    pub sessions: u64,
}

/// Backup side: pulls the primary's commit log into the local store.
pub struct HaBackup {
    store: Arc<MessageStore>,
    status_rx: watch::Receiver<BackupStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HaBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaBackup")
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}

struct BackupContext {
    store: Arc<MessageStore>,
    config: HaConfig,
    primary: SocketAddr,
    status: watch::Sender<BackupStatus>,
}

impl BackupContext {
    fn update(&self, f: impl FnOnce(&mut BackupStatus)) {
        self.status.send_modify(f);
    }
}

impl HaBackup {
    /// Start replicating from `config.primary_addr` into `store`.
    pub fn start(store: Arc<MessageStore>, config: HaConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let primary = config
            .primary_addr
            .ok_or_else(|| ClusterError::InvalidConfig("backup needs primary_addr".into()))?;
        if store.config().role.is_primary() {
            warn!("Replicating into a store configured as primary");
        }

        let (status, status_rx) = watch::channel(BackupStatus {
            state: BackupState::Disconnected,
            local_max: store.max_physical_offset(),
            primary_max: 0,
            last_error: None,
            gap_count: 0,
            sessions: 0,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = BackupContext {
            store: store.clone(),
            config,
            primary,
            status,
        };
        let task = tokio::spawn(run_backup(ctx, shutdown_rx));

        Ok(Arc::new(Self {
            store,
            status_rx,
            shutdown_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }))
    }

    pub fn status(&self) -> BackupStatus {
        self.status_rx.borrow().clone()
    }

    /// Whether the local log holds and has flushed everything below `offset`
    pub fn is_caught_up_to(&self, offset: u64) -> bool {
        self.store.flushed_offset() >= offset
    }

    /// Wait for [`is_caught_up_to`](Self::is_caught_up_to). False on timeout.
    pub async fn wait_caught_up(&self, offset: u64, wait: Duration) -> bool {
        let mut flushed = self.store.subscribe_flushed();
        let waited = timeout(wait, flushed.wait_for(|f| *f >= offset)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<BackupStatus> {
        self.status_rx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "HA backup task ended abnormally");
            }
        }
    }
}

impl Drop for HaBackup {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_backup(ctx: BackupContext, mut shutdown: watch::Receiver<bool>) {
    info!(primary = %ctx.primary, "HA backup started");
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }
        ctx.update(|s| s.state = BackupState::Connecting);

        match sync_session(&ctx, &mut shutdown, &mut attempt).await {
            Ok(()) => break,
            Err(ClusterError::UnrecoverableGap {
                requested,
                min_available,
            }) => {
                warn!(requested, min_available, "Primary no longer holds our offset");
                ctx.update(|s| {
                    s.gap_count += 1;
                    s.last_error = Some(
                        ClusterError::UnrecoverableGap {
                            requested,
                            min_available,
                        }
                        .to_string(),
                    );
                });
                if ctx.config.full_resync_on_gap {
                    match ctx.store.reset_for_resync(min_available) {
                        Ok(()) => {
                            info!(start = min_available, "Starting full resync");
                            attempt = 0;
                        }
                        Err(e) => error!(error = %e, "Full resync reset failed"),
                    }
                }
            }
            Err(e) if e.is_retriable() => {
                debug!(error = %e, "Replication session ended");
                ctx.update(|s| s.last_error = Some(e.to_string()));
            }
            Err(e) => {
                error!(error = %e, fatal = e.is_fatal(), "Replication stopped");
                ctx.update(|s| {
                    s.state = BackupState::Disconnected;
                    s.last_error = Some(e.to_string());
                });
                return;
            }
        }

        ctx.update(|s| {
            s.state = BackupState::Disconnected;
            s.local_max = ctx.store.max_physical_offset();
        });
        let delay = ctx.config.backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    ctx.update(|s| s.state = BackupState::Disconnected);
    info!(primary = %ctx.primary, "HA backup stopped");
}

/// One connection to the primary. `Ok` only on shutdown.
async fn sync_session(
    ctx: &BackupContext,
    shutdown: &mut watch::Receiver<bool>,
    attempt: &mut u32,
) -> Result<()> {
    let config = &ctx.config;
    let stream = timeout(config.connect_timeout, TcpStream::connect(ctx.primary))
        .await?
        .map_err(|e| ClusterError::ConnectionFailed(e.to_string()))?;
    let _ = stream.set_nodelay(true);
    ctx.update(|s| s.state = BackupState::Handshaking);

    let (mut reader, mut writer) = stream.into_split();
    let local_max = ctx.store.max_physical_offset();
    timeout(config.idle_timeout, write_report(&mut writer, local_max)).await??;
    debug!(primary = %ctx.primary, offset = local_max, "Sent handshake report");

    let (report_tx, report_rx) = watch::channel(local_max);
    let mut reporter = tokio::spawn(send_reports(writer, report_rx, config.clone()));

    let result = loop {
        tokio::select! {
            frame = timeout(config.idle_timeout, read_frame(&mut reader)) => {
                let frame = match frame {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => break Err(e),
                    Err(_) => break Err(ClusterError::Timeout),
                };
                if let Err(e) = apply_frame(ctx, frame, &report_tx, attempt).await {
                    break Err(e);
                }
            }
            ended = &mut reporter => {
                break match ended {
                    Ok(result) => result.and(Err(ClusterError::ConnectionClosed)),
                    Err(e) => Err(ClusterError::Protocol(format!("reporter failed: {}", e))),
                };
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };
    reporter.abort();
    result
}

async fn apply_frame(
    ctx: &BackupContext,
    frame: Frame,
    report_tx: &watch::Sender<u64>,
    attempt: &mut u32,
) -> Result<()> {
    let store = &ctx.store;
    match frame.kind {
        FrameKind::Gap => {
            return Err(ClusterError::UnrecoverableGap {
                requested: store.max_physical_offset(),
                min_available: frame.start_offset,
            });
        }
        FrameKind::Ahead => {
            return Err(ClusterError::BackupAhead {
                reported: store.max_physical_offset(),
                primary_max: frame.primary_max,
            });
        }
        FrameKind::Heartbeat => {}
        FrameKind::Data => {
            let local_max = store.max_physical_offset();
            if frame.start_offset != local_max {
                return Err(ClusterError::Protocol(format!(
                    "data frame at {} does not continue local max {}",
                    frame.start_offset, local_max
                )));
            }
            let end = store.append_replicated(frame.start_offset, &frame.body)?;
            store.flush().await?;
            report_tx.send_replace(end);
        }
    }

    let first = ctx.status.borrow().state != BackupState::Syncing;
    if first {
        *attempt = 0;
        info!(primary = %ctx.primary, primary_max = frame.primary_max, "Backup syncing");
    }
    ctx.update(|s| {
        if first {
            s.sessions += 1;
        }
        s.state = BackupState::Syncing;
        s.local_max = store.max_physical_offset();
        s.primary_max = frame.primary_max;
        s.last_error = None;
    });
    Ok(())
}

/// Report the local max offset after every applied frame and at least once
/// per heartbeat interval.
async fn send_reports(
    mut writer: OwnedWriteHalf,
    mut offsets: watch::Receiver<u64>,
    config: HaConfig,
) -> Result<()> {
    let mut tick = tokio::time::interval(config.heartbeat_interval);
    tick.reset();
    loop {
        tokio::select! {
            changed = offsets.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tick.tick() => {}
        }
        let offset = *offsets.borrow_and_update();
        timeout(config.idle_timeout, write_report(&mut writer, offset)).await??;
    }
}
