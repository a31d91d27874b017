//! Engine façade: lifecycle, the change pipeline and remote ingestion.
//!
//! Every detected change, whether from the watcher, a scan or another
//! device, goes through the same serialized pipeline: append to the
//! journal, update version state, classify, emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vaultsync_common::{content_hash, hash_file, DeviceId, Error, Result, VaultPath};

use crate::changelog::{ChangeLog, ChangeSource, ChangeType, FileChange};
use crate::config::SyncConfig;
use crate::conflict::{write_atomic, Conflict, ConflictResolver, Winner};
use crate::db::Database;
use crate::events::{
    EventBus, EventData, EventFilter, EventPattern, EventType, HandlerResult, Subscription,
    VaultEvent,
};
use crate::lock::LockManager;
use crate::retry::{retry, RetryConfig, RetryExecutor};
use crate::scanner::FullScanner;
use crate::scheduler::Scheduler;
use crate::state::SyncState;
use crate::watcher::{FileWatcher, NotifyBackend, WatchBackend};

const DEVICE_ID_KEY: &str = "device_id";

/// A change produced on another device, as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub change: FileChange,
    /// Remote bytes held apart from the vault until any conflict is
    /// resolved. `None` means the transport already wrote the file.
    pub content: Option<Vec<u8>>,
    /// Position of the change in the origin device's journal.
    pub remote_change_id: Option<i64>,
}

impl RemoteChange {
    pub fn new(change: FileChange) -> Self {
        Self {
            change,
            content: None,
            remote_change_id: None,
        }
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_remote_change_id(mut self, id: i64) -> Self {
        self.remote_change_id = Some(id);
        self
    }
}

/// Outcome counts of [`VaultSync::inject_remote_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectReport {
    pub applied: usize,
    pub conflicts: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Runtime {
    phase: Phase,
    watcher: Option<FileWatcher>,
    forwarder: Option<JoinHandle<()>>,
    scheduler: Scheduler,
}

/// The sync engine for one vault.
pub struct VaultSync {
    root: PathBuf,
    config: SyncConfig,
    device_id: DeviceId,
    /// Lock holder id; unique per engine instance so two processes on the
    /// same device still exclude each other.
    holder_id: String,
    db: Database,
    changelog: ChangeLog,
    state: SyncState,
    locks: LockManager,
    bus: EventBus,
    resolver: ConflictResolver,
    scanner: FullScanner,
    retry: RetryExecutor,
    /// Serializes the pipeline; never two drains at once.
    pipeline: Mutex<()>,
    runtime: Mutex<Runtime>,
}

impl VaultSync {
    /// Open the engine for the vault at `root` with native watching.
    ///
    /// # Errors
    /// - The vault root does not exist
    /// - The database cannot be created or migrated
    /// - An ignore pattern is invalid
    pub fn open(root: impl AsRef<Path>, config: SyncConfig) -> Result<Arc<Self>> {
        Self::open_with_backend(root, config, Box::new(NotifyBackend::new()))
    }

    /// Open with a caller-supplied watch backend.
    pub fn open_with_backend(
        root: impl AsRef<Path>,
        config: SyncConfig,
        backend: Box<dyn WatchBackend>,
    ) -> Result<Arc<Self>> {
        let root = std::fs::canonicalize(root.as_ref())?;
        let filter = config.path_filter()?;
        let db = Database::open(config.database_path_for(&root), config.busy_timeout())?;
        let device_id = resolve_device_id(&db, config.device_id.clone())?;
        let holder_id = format!(
            "{}:{}",
            device_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let state = SyncState::new(db.clone());
        let watcher = config.watch.then(|| {
            FileWatcher::new(
                root.clone(),
                filter.clone(),
                state.clone(),
                device_id.clone(),
                config.watch_timings(),
                backend,
            )
        });

        let engine = Self {
            changelog: ChangeLog::new(db.clone()),
            locks: LockManager::new(db.clone()),
            bus: EventBus::new(config.classification_rules.clone()),
            resolver: ConflictResolver::new(db.clone(), root.clone(), config.conflict_strategy),
            scanner: FullScanner::new(root.clone(), filter, state.clone(), device_id.clone()),
            retry: RetryExecutor::new(RetryConfig::default()),
            pipeline: Mutex::new(()),
            runtime: Mutex::new(Runtime {
                phase: Phase::Idle,
                watcher,
                forwarder: None,
                scheduler: Scheduler::new(),
            }),
            state,
            root,
            config,
            device_id,
            holder_id,
            db,
        };
        info!(
            "Opened vault {} as device {}",
            engine.root.display(),
            engine.device_id
        );
        Ok(Arc::new(engine))
    }

    /// Catch up with an initial scan, then start the watcher and the
    /// periodic jobs. A second call does nothing; a stopped engine cannot be
    /// restarted. If the watch backend cannot start, the engine runs on
    /// periodic scans alone.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        match runtime.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(Error::Closed),
            Phase::Idle => {}
        }

        self.trigger_scan().await?;

        let mut watch_failed = false;
        if let Some(watcher) = runtime.watcher.as_mut() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            match watcher.start(tx) {
                Ok(()) => {
                    let engine = Arc::downgrade(self);
                    runtime.forwarder = Some(tokio::spawn(async move {
                        while let Some(change) = rx.recv().await {
                            let Some(engine) = engine.upgrade() else {
                                break;
                            };
                            if let Err(e) = engine.process_changes(vec![change]).await {
                                warn!("Dropping watcher change: {}", e);
                            }
                        }
                    }));
                }
                Err(e) => {
                    // periodic scans remain the detector
                    error!("Watcher unavailable for {}: {}", self.root.display(), e);
                    watch_failed = true;
                }
            }
        }
        if watch_failed {
            runtime.watcher = None;
        }

        let weak = Arc::downgrade(self);
        runtime
            .scheduler
            .spawn_every("scan", self.config.scan_interval(), move || {
                periodic(weak.clone(), |engine| async move {
                    engine.trigger_scan().await.map(|_| ())
                })
            });
        let weak = Arc::downgrade(self);
        runtime.scheduler.spawn_every(
            "lock-cleanup",
            self.config.lock_cleanup_interval(),
            move || {
                periodic(weak.clone(), |engine| async move {
                    let locks = engine.locks.clone();
                    retry(move || {
                        let locks = locks.clone();
                        async move { locks.cleanup_expired().map(|_| ()) }
                    })
                    .await
                })
            },
        );

        runtime.phase = Phase::Running;
        info!("Sync engine started for {}", self.root.display());
        Ok(())
    }

    /// Stop the watcher and timers and close the database. Does nothing
    /// unless the engine is running.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.phase != Phase::Running {
            return Ok(());
        }
        runtime.scheduler.shutdown();
        if let Some(watcher) = runtime.watcher.as_mut() {
            watcher.stop();
        }
        if let Some(forwarder) = runtime.forwarder.take() {
            forwarder.abort();
        }

        // let an in-flight drain finish before the handle goes away
        let _pipeline = self.pipeline.lock().await;
        self.db.close();
        runtime.phase = Phase::Stopped;
        info!("Sync engine stopped for {}", self.root.display());
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.phase == Phase::Running
    }

    /// Run `changes` through the pipeline in order and return the emitted
    /// events. Changes that would not alter state (same hash, delete of an
    /// untracked path) are dropped; a change that fails is logged and
    /// skipped.
    pub async fn process_changes(&self, changes: Vec<FileChange>) -> Result<Vec<VaultEvent>> {
        let _pipeline = self.pipeline.lock().await;
        self.drain(&changes)
    }

    fn drain(&self, changes: &[FileChange]) -> Result<Vec<VaultEvent>> {
        let mut events = Vec::with_capacity(changes.len());
        for change in changes {
            match self.apply(change) {
                Ok(Some(event)) => {
                    self.bus.emit(&event);
                    events.push(event);
                }
                Ok(None) => {}
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => warn!("Skipping {} of {}: {}", change.change_type, change.path, e),
            }
        }
        Ok(events)
    }

    /// Journal, update state and classify one change.
    fn apply(&self, change: &FileChange) -> Result<Option<VaultEvent>> {
        let current = self.state.get_file_state(&change.path)?;
        match change.change_type {
            ChangeType::Create | ChangeType::Modify => {
                if current.as_ref().map(|c| &c.content_hash) == change.content_hash.as_ref() {
                    debug!("{} unchanged, skipping", change.path);
                    return Ok(None);
                }
            }
            ChangeType::Delete if current.is_none() => {
                debug!("{} not tracked, skipping delete", change.path);
                return Ok(None);
            }
            _ => {}
        }

        let change_id = self.changelog.append(change)?;
        match change.change_type {
            ChangeType::Create | ChangeType::Modify => {
                let hash = change.content_hash.as_deref().ok_or_else(|| {
                    Error::InvalidInput(format!("{} of {} has no hash", change.change_type, change.path))
                })?;
                self.state.record_version(
                    &change.path,
                    hash,
                    change.size,
                    change.mtime,
                    &change.device_id,
                )?;
            }
            ChangeType::Delete => {
                self.state.remove_file(&change.path)?;
            }
            ChangeType::Rename => {
                let old = change.old_path.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!("rename to {} has no source", change.path))
                })?;
                self.state.handle_rename(old, &change.path)?;
                if let Some(hash) = change.content_hash.as_deref() {
                    let moved = self.state.get_file_state(&change.path)?;
                    if moved.map_or(true, |m| m.content_hash != hash) {
                        self.state.record_version(
                            &change.path,
                            hash,
                            change.size,
                            change.mtime,
                            &change.device_id,
                        )?;
                    }
                }
            }
        }

        let mut event = self.bus.classify_change(change);
        event.change_id = Some(change_id);
        debug!("#{} {} {}", change_id, event.event_type, change.path);
        Ok(Some(event))
    }

    /// Reconcile the whole vault now and return how many changes were found.
    pub async fn trigger_scan(&self) -> Result<usize> {
        let _pipeline = self.pipeline.lock().await;
        self.bus.emit(&VaultEvent::engine(
            EventType::SCAN_STARTED,
            VaultPath::root(),
            EventData::None,
        ));

        let scanner = self.scanner.clone();
        let changes = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| Error::InvalidInput(format!("scan task failed: {}", e)))??;
        let change_count = changes.len();
        self.drain(&changes)?;

        self.bus.emit(&VaultEvent::engine(
            EventType::SCAN_COMPLETED,
            VaultPath::root(),
            EventData::Scan { change_count },
        ));
        Ok(change_count)
    }

    /// Apply changes that originated on other devices.
    ///
    /// Echoes of this device's own changes are skipped. A change that
    /// conflicts with local state is resolved first and applied only if the
    /// remote side wins.
    pub async fn inject_remote_changes(&self, changes: Vec<RemoteChange>) -> Result<InjectReport> {
        let _pipeline = self.pipeline.lock().await;
        let mut report = InjectReport::default();

        for remote in changes {
            if remote.change.device_id == self.device_id {
                debug!("Suppressing echo of {}", remote.change.path);
                report.skipped += 1;
                continue;
            }
            let origin = remote.change.device_id.clone();
            let remote_change_id = remote.remote_change_id;
            let path = remote.change.path.clone();

            match self.ingest(remote) {
                Ok((applied, conflicted)) => {
                    if applied {
                        report.applied += 1;
                    } else {
                        report.skipped += usize::from(!conflicted);
                    }
                    report.conflicts += usize::from(conflicted);
                }
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => {
                    warn!("Rejected remote change to {}: {}", path, e);
                    report.skipped += 1;
                    continue;
                }
            }
            if let Some(id) = remote_change_id {
                let origin = &origin;
                self.retry
                    .execute(move || async move { self.db.update_peer_cursor(origin, id) })
                    .await?;
            }
        }

        info!(
            "Remote changes: {} applied, {} conflicts, {} skipped",
            report.applied, report.conflicts, report.skipped
        );
        Ok(report)
    }

    /// Returns `(applied, conflicted)`.
    fn ingest(&self, remote: RemoteChange) -> Result<(bool, bool)> {
        let RemoteChange { change, content, .. } = remote;
        let local = self.state.get_file_state(&change.path)?;

        let Some(conflict) = self.resolver.detect_conflict(local.as_ref(), &change) else {
            if let Some(bytes) = content.as_deref() {
                self.materialize(&change, bytes)?;
            }
            return Ok((self.drain(std::slice::from_ref(&change))?.len() == 1, false));
        };

        if content.is_none() && !change.path.to_fs(&self.root).exists() {
            return Err(Error::NotFound(format!(
                "remote content for {} is neither staged nor on disk",
                change.path
            )));
        }

        self.emit_conflict(EventType::CONFLICT_DETECTED, &conflict);
        let resolved = self.resolver.resolve(conflict, content.as_deref())?;
        if !resolved.is_pending() {
            self.emit_conflict(EventType::CONFLICT_RESOLVED, &resolved);
        }

        let remote_won = resolved
            .resolution
            .as_ref()
            .is_some_and(|r| r.winner == Winner::Remote && r.resolved_at.is_some());
        if !remote_won {
            return Ok((false, true));
        }

        // the file now holds the remote or merged content; record what is on disk
        let fs_path = change.path.to_fs(&self.root);
        let meta = std::fs::metadata(&fs_path)?;
        let applied = FileChange::written(
            change.path.clone(),
            ChangeType::Modify,
            hash_file(&fs_path)?,
            meta.len(),
            DateTime::<Utc>::from(meta.modified()?),
            ChangeSource::Remote,
            change.device_id.clone(),
        )
        .with_detected_at(change.detected_at);
        Ok((self.drain(std::slice::from_ref(&applied))?.len() == 1, true))
    }

    /// Write staged remote bytes for a non-conflicting create or modify.
    fn materialize(&self, change: &FileChange, bytes: &[u8]) -> Result<()> {
        if !matches!(change.change_type, ChangeType::Create | ChangeType::Modify) {
            return Ok(());
        }
        let hash = content_hash(bytes);
        if change.content_hash.as_deref() != Some(hash.as_str()) {
            return Err(Error::InvalidInput(format!(
                "staged content for {} does not match its hash",
                change.path
            )));
        }
        write_atomic(&change.path.to_fs(&self.root), bytes)
    }

    fn emit_conflict(&self, event_type: EventType, conflict: &Conflict) {
        let resolution = conflict.resolution.as_ref();
        self.bus.emit(&VaultEvent::engine(
            event_type,
            conflict.path.clone(),
            EventData::Conflict {
                conflict_id: conflict.conflict_id.clone(),
                winner: resolution.map(|r| r.winner),
                loser_path: resolution.map(|r| r.loser_path.clone()),
            },
        ));
    }

    /// Run `f` while holding the advisory lock on `path`.
    ///
    /// Fails with [`Error::LockContended`] if another holder has it.
    pub async fn with_lock<F, Fut, T>(&self, path: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.locks
            .with_lock(path, &self.holder_id, self.config.default_lock_ttl(), f)
            .await
    }

    /// Like [`VaultSync::with_lock`], but backs off and retries while the
    /// lock is contended.
    pub async fn with_lock_retry<F, Fut, T>(&self, path: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ttl = self.config.default_lock_ttl();
        let guard = self
            .retry
            .execute_contended(move || async move { self.locks.guard(path, &self.holder_id, ttl) })
            .await?;
        let result = f().await;
        guard.release()?;
        result
    }

    /// Subscribe to one event type, or `*`.
    pub fn on<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> Subscription
    where
        F: Fn(&VaultEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.bus.on(pattern, handler)
    }

    /// Subscribe to a filtered slice of events.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&VaultEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.bus.subscribe(filter, handler)
    }

    /// Recorded conflicts; with `pending_only`, those awaiting a decision.
    pub fn conflicts(&self, pending_only: bool) -> Result<Vec<Conflict>> {
        self.resolver.list(pending_only)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }
}

async fn periodic<F, Fut>(engine: Weak<VaultSync>, job: F)
where
    F: FnOnce(Arc<VaultSync>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(engine) = engine.upgrade() else {
        return;
    };
    if let Err(e) = job(engine).await {
        warn!("Periodic job failed: {}", e);
    }
}

/// Configured id, else the one stored in the database, else a fresh one
/// that is stored for next time.
fn resolve_device_id(db: &Database, configured: Option<DeviceId>) -> Result<DeviceId> {
    if let Some(id) = configured {
        return Ok(id);
    }
    if let Some(stored) = db.get_meta(DEVICE_ID_KEY)? {
        return DeviceId::new(stored);
    }
    let id = DeviceId::generate();
    db.set_meta(DEVICE_ID_KEY, id.as_str())?;
    info!("Generated device id {}", id);
    Ok(id)
}
