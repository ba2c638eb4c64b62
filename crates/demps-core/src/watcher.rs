//! Directory watching for simulator output.
//!
//! A [`DirectoryWatcher`] wraps a `notify` backend and turns its raw,
//! platform-specific events into a de-duplicated stream of
//! [`WatchEvent`]s: one `Ready` after the initial listing, then one
//! `FileAdded` / `DirAdded` per new path.
//!
//! With the native backend on Linux a regular file is reported when its
//! writer closes it, not when it is created, so a subscriber that reads
//! the file on `FileAdded` sees its complete content. Directories, and
//! files moved into place, are reported as soon as they appear. A file
//! found by a directory listing may still be open, so one modified within
//! the last `settle` period is held back until it is closed, stays
//! untouched for that long, or a later file is closed or moved in (the
//! simulator writes its files one after another). Other backends report
//! files on creation.
//!
//! Watched paths do not have to exist yet. The simulator creates its
//! output directories only once it starts, so a missing path is parked
//! and re-checked every `poll_interval`; when it appears it is attached
//! to the backend and reported together with everything already inside
//! it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::pool::Closeable;

/// Lower bound for `poll_interval`; timers reject a zero period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Events a watcher delivers to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The initial listing of the watched paths is complete. Sent once.
    Ready,
    /// A regular file appeared.
    FileAdded(PathBuf),
    /// A directory appeared.
    DirAdded(PathBuf),
}

/// Backend and reporting options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Use the stat-polling backend instead of native notifications.
    pub use_polling: bool,
    /// Poll period for the polling backend and for missing paths.
    /// Values below [`MIN_POLL_INTERVAL`] are raised to it.
    pub poll_interval: Duration,
    /// How long a listed file must stay untouched before it is reported
    /// without a close event. Only used when files are reported on close;
    /// zero reports listed files at once.
    pub settle: Duration,
    /// Do not report entries present at the initial listing.
    pub ignore_initial: bool,
    /// Watch subdirectories as well.
    pub recursive: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            use_polling: false,
            poll_interval: Duration::from_millis(500),
            settle: Duration::from_secs(1),
            ignore_initial: true,
            recursive: true,
        }
    }
}

/// Errors creating a watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The notification backend could not be created.
    #[error("failed to create {label} watcher backend: {source}")]
    Backend {
        /// Watcher label.
        label: String,
        /// Backend error.
        source: notify::Error,
    },

    /// The watcher has already been closed.
    #[error("{label} watcher is closed")]
    Closed {
        /// Watcher label.
        label: String,
    },
}

type RawEvent = notify::Result<notify::Event>;

/// Handle to a running watcher. Events arrive on the receiver returned by
/// [`watch`](Self::watch); the stream ends after [`close`](Closeable::close).
pub struct DirectoryWatcher {
    label: String,
    control: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
    closed: Arc<AtomicBool>,
}

impl DirectoryWatcher {
    /// Start watching `path`. Must be called inside a tokio runtime.
    pub fn watch(
        label: impl Into<String>,
        path: impl Into<PathBuf>,
        mut options: WatchOptions,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>), WatchError> {
        let label = label.into();
        options.poll_interval = options.poll_interval.max(MIN_POLL_INTERVAL);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawEvent>();
        let handler = move |event: RawEvent| {
            let _ = raw_tx.send(event);
        };

        let backend: Result<Box<dyn Watcher + Send>, notify::Error> = if options.use_polling {
            let config = notify::Config::default().with_poll_interval(options.poll_interval);
            PollWatcher::new(handler, config).map(|w| Box::new(w) as Box<dyn Watcher + Send>)
        } else {
            RecommendedWatcher::new(handler, notify::Config::default())
                .map(|w| Box::new(w) as Box<dyn Watcher + Send>)
        };
        let backend = backend.map_err(|source| WatchError::Backend {
            label: label.clone(),
            source,
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            label: label.clone(),
            mode: if options.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            },
            files_on_close: reports_close_write(options.use_polling),
            options,
            backend,
            events: events_tx,
            closed: Arc::clone(&closed),
            roots: Vec::new(),
            pending: Vec::new(),
            seen: HashSet::new(),
            settling: HashMap::new(),
        };
        tokio::spawn(driver.run(path.into(), raw_rx, control_rx));

        let watcher = Arc::new(Self {
            label,
            control: Mutex::new(Some(control_tx)),
            closed,
        });
        Ok((watcher, events_rx))
    }

    /// Watcher label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Add another path to this watcher. Its current contents are treated
    /// like the initial listing.
    pub fn add_path(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        control
            .as_ref()
            .and_then(|tx| tx.send(path.into()).ok())
            .ok_or_else(|| WatchError::Closed {
                label: self.label.clone(),
            })
    }

    /// Whether [`close`](Closeable::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closeable for DirectoryWatcher {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if control.is_some() {
            debug!(label = %self.label, "Watcher closed");
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Task-side state of one watcher.
struct Driver {
    label: String,
    options: WatchOptions,
    mode: RecursiveMode,
    /// Report regular files on close-after-write instead of on create.
    files_on_close: bool,
    backend: Box<dyn Watcher + Send>,
    events: mpsc::UnboundedSender<WatchEvent>,
    closed: Arc<AtomicBool>,
    roots: Vec<PathBuf>,
    pending: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
    /// Listed files waiting for a close event or a quiet period, with the
    /// instant they may be reported.
    settling: HashMap<PathBuf, Instant>,
}

impl Driver {
    async fn run(
        mut self,
        initial: PathBuf,
        mut raw: mpsc::UnboundedReceiver<RawEvent>,
        mut control: mpsc::UnboundedReceiver<PathBuf>,
    ) {
        self.add_root(initial, self.options.ignore_initial).await;
        self.emit(WatchEvent::Ready);
        info!(label = %self.label, roots = ?self.roots, pending = ?self.pending, "Watcher ready");

        let mut tick = tokio::time::interval(self.options.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.closed.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(path) => self.add_root(path, self.options.ignore_initial).await,
                    None => break,
                },
                event = raw.recv() => match event {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(e)) => warn!(label = %self.label, error = %e, "Watcher backend error"),
                    None => break,
                },
                _ = tick.tick(), if !self.pending.is_empty() || !self.settling.is_empty() => {
                    self.check_pending().await;
                    self.release_settled().await;
                }
            }
        }
        debug!(label = %self.label, "Watcher driver stopped");
    }

    /// Send `event` unless the watcher was closed or the subscriber left.
    fn emit(&self, event: WatchEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.events.send(event).is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Attach `path` to the backend and list its contents, or park it
    /// when it does not exist yet.
    async fn add_root(&mut self, path: PathBuf, silent: bool) {
        if !exists(&path).await {
            debug!(label = %self.label, path = %path.display(), "Watched path missing, polling for it");
            if !self.pending.contains(&path) {
                self.pending.push(path);
            }
            return;
        }
        if let Err(e) = self.backend.watch(&path, self.mode) {
            warn!(label = %self.label, path = %path.display(), error = %e, "Failed to attach watched path, will retry");
            if !self.pending.contains(&path) {
                self.pending.push(path);
            }
            return;
        }
        self.seen.insert(path.clone());
        self.list(&path, silent).await;
        if !self.roots.contains(&path) {
            self.roots.push(path);
        }
    }

    async fn check_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for path in pending {
            if !exists(&path).await {
                self.pending.push(path);
                continue;
            }
            if let Err(e) = self.backend.watch(&path, self.mode) {
                debug!(label = %self.label, path = %path.display(), error = %e, "Watched path not attachable yet");
                self.pending.push(path);
                continue;
            }
            info!(label = %self.label, path = %path.display(), "Watched path appeared");
            self.report(path.clone()).await;
            if !self.roots.contains(&path) {
                self.roots.push(path);
            }
        }
    }

    async fn handle(&mut self, event: notify::Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    if self.files_on_close && !is_dir(&path).await {
                        continue;
                    }
                    self.report(path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in event.paths {
                    self.release_before(&path);
                    self.report(path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let Some(from) = paths.next() {
                    self.forget(&from);
                }
                if let Some(to) = paths.next() {
                    self.release_before(&to);
                    self.report(to).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for path in &event.paths {
                    self.forget(path);
                }
            }
            EventKind::Modify(_) => {
                // Some backends only report writes for paths they never
                // announced. Existing unseen paths count as new; files
                // still open for writing wait for their close.
                for path in event.paths {
                    if self.settling.contains_key(&path) {
                        let deadline = self.settle_deadline();
                        self.settling.insert(path, deadline);
                        continue;
                    }
                    if self.seen.contains(&path) || !exists(&path).await {
                        continue;
                    }
                    if self.files_on_close && !is_dir(&path).await {
                        continue;
                    }
                    self.report(path).await;
                }
            }
            _ => {}
        }
    }

    /// Report a newly observed path, and the contents of a new directory.
    async fn report(&mut self, path: PathBuf) {
        self.settling.remove(&path);
        if self.seen.contains(&path) {
            return;
        }
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            // Removed again before it could be classified.
            return;
        };
        self.seen.insert(path.clone());
        if meta.is_dir() {
            debug!(label = %self.label, path = %path.display(), "Directory added");
            self.emit(WatchEvent::DirAdded(path.clone()));
            if matches!(self.mode, RecursiveMode::Recursive) {
                self.list(&path, false).await;
            }
        } else {
            debug!(label = %self.label, path = %path.display(), "File added");
            self.emit(WatchEvent::FileAdded(path));
        }
    }

    /// Mark every entry under `root` as seen, reporting unseen ones
    /// unless `silent`.
    async fn list(&mut self, root: &Path, silent: bool) {
        let recursive = matches!(self.mode, RecursiveMode::Recursive);
        let owned = root.to_path_buf();
        let entries = match tokio::task::spawn_blocking(move || scan(&owned, recursive)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(label = %self.label, path = %root.display(), error = %e, "Directory scan failed");
                return;
            }
        };
        for entry in entries {
            if self.seen.contains(&entry.path) || self.settling.contains_key(&entry.path) {
                continue;
            }
            if silent {
                self.seen.insert(entry.path);
            } else if entry.is_dir {
                self.seen.insert(entry.path.clone());
                self.emit(WatchEvent::DirAdded(entry.path));
            } else if self.may_be_open(entry.modified) {
                debug!(label = %self.label, path = %entry.path.display(), "Listed file recently modified, waiting for it to settle");
                let deadline = self.settle_deadline();
                self.settling.insert(entry.path, deadline);
            } else {
                self.seen.insert(entry.path.clone());
                self.emit(WatchEvent::FileAdded(entry.path));
            }
        }
    }

    /// Whether a listed file last modified at `modified` could still be
    /// open for writing.
    fn may_be_open(&self, modified: Option<SystemTime>) -> bool {
        if !self.files_on_close || self.options.settle.is_zero() {
            return false;
        }
        modified
            .and_then(|at| at.elapsed().ok())
            .is_none_or(|age| age < self.options.settle)
    }

    fn settle_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.options.settle).unwrap_or(now)
    }

    /// Report every settling file other than `completed`, in name order,
    /// ahead of it.
    fn release_before(&mut self, completed: &Path) {
        if self.settling.is_empty() {
            return;
        }
        let mut earlier: Vec<PathBuf> = self
            .settling
            .drain()
            .map(|(path, _)| path)
            .filter(|path| path != completed)
            .collect();
        earlier.sort();
        for path in earlier {
            if self.seen.insert(path.clone()) {
                self.emit(WatchEvent::FileAdded(path));
            }
        }
    }

    /// Report settling files whose quiet period has elapsed, in name order.
    async fn release_settled(&mut self) {
        let now = Instant::now();
        let mut due: Vec<PathBuf> = self
            .settling
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();
        for path in due {
            self.report(path).await;
        }
    }

    /// Drop `path` and everything below it from the seen set so it can be
    /// reported again if re-created.
    fn forget(&mut self, path: &Path) {
        self.seen.retain(|seen| !seen.starts_with(path));
        self.settling.retain(|settling, _| !settling.starts_with(path));
        if self.roots.iter().any(|root| root == path) {
            info!(label = %self.label, path = %path.display(), "Watched path removed, polling for it");
            self.roots.retain(|root| root != path);
            let _ = self.backend.unwatch(path);
            if !self.pending.iter().any(|p| p == path) {
                self.pending.push(path.to_path_buf());
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

/// Whether the backend selected by `use_polling` delivers close-after-write
/// events. Only inotify does.
const fn reports_close_write(use_polling: bool) -> bool {
    !use_polling && cfg!(any(target_os = "linux", target_os = "android"))
}

/// One entry of a directory listing.
#[derive(Debug, PartialEq, Eq)]
struct Listed {
    path: PathBuf,
    is_dir: bool,
    modified: Option<SystemTime>,
}

/// Entries below `root` in name order.
fn scan(root: &Path, recursive: bool) -> Vec<Listed> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .map(|entry| {
            let is_dir = entry.file_type().is_dir();
            let modified = entry.metadata().ok().and_then(|meta| meta.modified().ok());
            Listed {
                path: entry.into_path(),
                is_dir,
                modified,
            }
        })
        .collect()
}
