//! Live filesystem notifications turned into settled `FileChange`s.
//!
//! Raw events pass the ignore and document filters, then a per-path
//! debounce timer that restarts on every new event for the same path. When
//! the timer fires, the file's mtime is sampled, the watcher waits for the
//! stability window and samples again; a moving mtime restarts the wait.
//! Only a settled file is hashed. Deletions skip the stability wait.

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use vaultsync_common::{hash_file, DeviceId, Error, PathFilter, Result, VaultPath};

use crate::changelog::{ChangeSource, ChangeType, FileChange};
use crate::state::SyncState;

/// Filesystem event as reported by a backend, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Created or written.
    Changed(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Source of raw filesystem events.
///
/// Where native recursive watching is unavailable a backend may deliver
/// nothing at all; the periodic full scan still catches every change.
pub trait WatchBackend: Send {
    /// Begin delivering events for everything below `root` into `sink`.
    fn start(&mut self, root: &Path, sink: mpsc::UnboundedSender<RawEvent>) -> Result<()>;

    /// Stop delivering events. Idempotent.
    fn stop(&mut self);
}

/// Native recursive watching through `notify`.
#[derive(Default)]
pub struct NotifyBackend {
    watcher: Option<RecommendedWatcher>,
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn convert(event: Event) -> Vec<RawEvent> {
        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => vec![RawEvent::Renamed { from, to }],
                    (Some(path), None) => vec![RawEvent::Changed(path)],
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                paths.map(RawEvent::Removed).collect()
            }
            EventKind::Create(_) | EventKind::Modify(_) => paths.map(RawEvent::Changed).collect(),
            _ => Vec::new(),
        }
    }
}

impl WatchBackend for NotifyBackend {
    fn start(&mut self, root: &Path, sink: mpsc::UnboundedSender<RawEvent>) -> Result<()> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for raw in Self::convert(event) {
                    let _ = sink.send(raw);
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })
        .map_err(|e| Error::Watcher(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        self.watcher = None;
    }
}

/// Backend fed by hand, for tests and for hosts that deliver their own
/// notifications. Clones share one sink.
#[derive(Clone, Default)]
pub struct ChannelBackend {
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<RawEvent>>>>,
}

impl ChannelBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event. Returns `false` when the backend is not started.
    pub fn inject(&self, event: RawEvent) -> bool {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.as_ref().map_or(false, |s| s.send(event).is_ok())
    }
}

impl WatchBackend for ChannelBackend {
    fn start(&mut self, _root: &Path, sink: mpsc::UnboundedSender<RawEvent>) -> Result<()> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Debounce and stability timings.
#[derive(Debug, Clone, Copy)]
pub struct WatchTimings {
    pub debounce: Duration,
    pub stability: Duration,
}

impl Default for WatchTimings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            stability: Duration::from_millis(1000),
        }
    }
}

struct Settler {
    root: PathBuf,
    state: SyncState,
    device_id: DeviceId,
    timings: WatchTimings,
    out: mpsc::UnboundedSender<FileChange>,
}

struct PendingSettle {
    generation: u64,
    rename_from: Option<VaultPath>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PendingMap {
    next_generation: u64,
    entries: HashMap<VaultPath, PendingSettle>,
}

type SharedPending = Arc<Mutex<PendingMap>>;

/// Turns backend events into settled changes with `source = watcher`.
pub struct FileWatcher {
    root: PathBuf,
    filter: PathFilter,
    state: SyncState,
    device_id: DeviceId,
    timings: WatchTimings,
    backend: Box<dyn WatchBackend>,
    dispatcher: Option<JoinHandle<()>>,
    pending: SharedPending,
}

impl FileWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        filter: PathFilter,
        state: SyncState,
        device_id: DeviceId,
        timings: WatchTimings,
        backend: Box<dyn WatchBackend>,
    ) -> Self {
        Self {
            root: root.into(),
            filter,
            state,
            device_id,
            timings,
            backend,
            dispatcher: None,
            pending: Arc::new(Mutex::new(PendingMap::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Start the backend and the dispatcher task; settled changes are sent
    /// to `out`. Calling it on a running watcher does nothing.
    pub fn start(&mut self, out: mpsc::UnboundedSender<FileChange>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        self.backend.start(&self.root, raw_tx)?;

        let settler = Arc::new(Settler {
            root: self.root.clone(),
            state: self.state.clone(),
            device_id: self.device_id.clone(),
            timings: self.timings,
            out,
        });
        let filter = self.filter.clone();
        let pending = self.pending.clone();

        self.dispatcher = Some(tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                trace!("Raw event: {:?}", raw);
                dispatch(&settler, &filter, &pending, raw);
            }
        }));
        info!("Watching {}", self.root.display());
        Ok(())
    }

    /// Stop the backend, the dispatcher and every pending settle.
    pub fn stop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.backend.stop();
        dispatcher.abort();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in pending.entries.drain() {
            entry.handle.abort();
        }
        info!("Stopped watching {}", self.root.display());
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(settler: &Arc<Settler>, filter: &PathFilter, pending: &SharedPending, raw: RawEvent) {
    let to_vault = |path: &Path| match VaultPath::from_fs(&settler.root, path) {
        Ok(p) if filter.accepts(&p) => Some(p),
        Ok(_) => None,
        Err(e) => {
            trace!("Skipping event outside vault: {}", e);
            None
        }
    };

    match raw {
        RawEvent::Changed(path) | RawEvent::Removed(path) => {
            if let Some(path) = to_vault(&path) {
                schedule(settler, pending, path, None);
            }
        }
        RawEvent::Renamed { from, to } => match (to_vault(&from), to_vault(&to)) {
            (Some(from), Some(to)) => {
                cancel(pending, &from);
                schedule(settler, pending, to, Some(from));
            }
            (None, Some(to)) => schedule(settler, pending, to, None),
            (Some(from), None) => schedule(settler, pending, from, None),
            (None, None) => {}
        },
    }
}

fn cancel(pending: &SharedPending, path: &VaultPath) {
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = pending.entries.remove(path) {
        entry.handle.abort();
    }
}

/// (Re)start the debounce timer for `path`.
fn schedule(
    settler: &Arc<Settler>,
    pending: &SharedPending,
    path: VaultPath,
    rename_from: Option<VaultPath>,
) {
    let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
    let mut rename_from = rename_from;
    if let Some(previous) = map.entries.remove(&path) {
        previous.handle.abort();
        rename_from = rename_from.or(previous.rename_from);
    }
    map.next_generation += 1;
    let generation = map.next_generation;

    let task_settler = settler.clone();
    let task_pending = pending.clone();
    let task_path = path.clone();
    let task_from = rename_from.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(task_settler.timings.debounce).await;
        match task_settler.settle(&task_path, task_from).await {
            Ok(Some(change)) => {
                debug!("Settled {} {}", change.change_type, change.path);
                let _ = task_settler.out.send(change);
            }
            Ok(None) => trace!("No change for {}", task_path),
            Err(e) => warn!("Skipping {}: {}", task_path, e),
        }
        let mut map = task_pending.lock().unwrap_or_else(PoisonError::into_inner);
        if map
            .entries
            .get(&task_path)
            .is_some_and(|e| e.generation == generation)
        {
            map.entries.remove(&task_path);
        }
    });

    map.entries.insert(
        path,
        PendingSettle {
            generation,
            rename_from,
            handle,
        },
    );
}

fn stat(path: &Path) -> Result<Option<Metadata>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn mtime_of(meta: &Metadata) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(meta.modified()?))
}

impl Settler {
    /// Wait for `path` to stop changing, then describe what happened to it.
    async fn settle(
        &self,
        path: &VaultPath,
        rename_from: Option<VaultPath>,
    ) -> Result<Option<FileChange>> {
        let fs_path = path.to_fs(&self.root);

        let meta = loop {
            let Some(before) = stat(&fs_path)? else {
                return self.deletion(path);
            };
            tokio::time::sleep(self.timings.stability).await;
            let Some(after) = stat(&fs_path)? else {
                return self.deletion(path);
            };
            if mtime_of(&before)? == mtime_of(&after)? && before.len() == after.len() {
                break after;
            }
            trace!("{} still changing", path);
        };
        if !meta.is_file() {
            return Ok(None);
        }

        let mtime = mtime_of(&meta)?;
        let size = meta.len();
        let hash = {
            let fs_path = fs_path.clone();
            tokio::task::spawn_blocking(move || hash_file(&fs_path))
                .await
                .map_err(|e| Error::Watcher(format!("hash task failed: {}", e)))??
        };

        if let Some(old) = rename_from {
            if self.state.get_file_state(&old)?.is_some() {
                return Ok(Some(FileChange::renamed(
                    old,
                    path.clone(),
                    hash,
                    size,
                    mtime,
                    ChangeSource::Watcher,
                    self.device_id.clone(),
                )));
            }
        }

        let change_type = match self.state.get_file_state(path)? {
            Some(current) if current.content_hash == hash => return Ok(None),
            Some(_) => ChangeType::Modify,
            None => ChangeType::Create,
        };
        Ok(Some(FileChange::written(
            path.clone(),
            change_type,
            hash,
            size,
            mtime,
            ChangeSource::Watcher,
            self.device_id.clone(),
        )))
    }

    fn deletion(&self, path: &VaultPath) -> Result<Option<FileChange>> {
        if self.state.get_file_state(path)?.is_none() {
            return Ok(None);
        }
        Ok(Some(FileChange::deleted(
            path.clone(),
            ChangeSource::Watcher,
            self.device_id.clone(),
        )))
    }
}
