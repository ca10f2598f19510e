//! Reload watcher: file events in, debounced reloads out.
//!
//! The `notify` callback runs on its own thread and only forwards events
//! into a channel. A tokio task collects them in [`PendingReloads`] and, one
//! debounce window after the first event of a batch, loads every touched module.
//! A module that fails to load keeps its previous pool.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::host::{ModuleHost, WATCHER_SOURCE, module_name};
use modhost_common::HostError;

/// What the host watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Every module file directly inside a directory.
    Directory(PathBuf),
    /// One module file. Its parent directory is watched.
    File { dir: PathBuf, file: PathBuf },
}

impl WatchTarget {
    /// Classify `path`. A path with the module extension that is not a
    /// directory is a single-file target; anything else is a directory.
    pub fn resolve(path: &Path, extension: &str) -> Self {
        let is_module_file =
            !path.is_dir() && path.extension().is_some_and(|ext| ext == extension);

        if is_module_file {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            Self::File {
                dir,
                file: path.to_path_buf(),
            }
        } else {
            Self::Directory(path.to_path_buf())
        }
    }

    /// Directory that is watched and that module names resolve in.
    pub fn dir(&self) -> &Path {
        match self {
            Self::Directory(dir) | Self::File { dir, .. } => dir,
        }
    }

    /// Create the watched directory if it does not exist yet.
    pub fn prepare(&self) -> Result<(), HostError> {
        let dir = self.dir();
        if dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(dir).map_err(|e| {
            HostError::invalid_config(format!("Cannot create {}: {e}", dir.display()))
        })?;
        info!(dir = %dir.display(), "Created module directory");
        Ok(())
    }

    /// File a module name resolves to.
    pub fn module_path(&self, name: &str, extension: &str) -> PathBuf {
        if let Self::File { file, .. } = self {
            if module_name(file).as_deref() == Some(name) {
                return file.clone();
            }
        }
        self.dir().join(format!("{name}.{extension}"))
    }

    /// Module files currently present, sorted by path.
    pub fn module_files(&self, extension: &str) -> Result<Vec<PathBuf>, HostError> {
        match self {
            Self::File { file, .. } => Ok(if file.is_file() {
                vec![file.clone()]
            } else {
                Vec::new()
            }),
            Self::Directory(dir) => {
                let entries = std::fs::read_dir(dir).map_err(|e| {
                    HostError::invalid_config(format!("Cannot read {}: {e}", dir.display()))
                })?;

                let mut files: Vec<PathBuf> = entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file() && has_extension(path, extension))
                    .collect();
                files.sort();
                Ok(files)
            }
        }
    }

    /// Returns `true` if an event on `path` concerns a watched module.
    pub fn accepts(&self, path: &Path, extension: &str) -> bool {
        match self {
            Self::File { file, .. } => path.file_name() == file.file_name(),
            Self::Directory(_) => has_extension(path, extension),
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
}

/// Module files touched since the last flush.
///
/// The deadline is fixed by the first event of a batch. Later events join the
/// batch without moving it, so a steady stream of writes cannot starve reloads.
#[derive(Debug)]
pub struct PendingReloads {
    window: Duration,
    files: BTreeSet<PathBuf>,
    deadline: Option<Instant>,
}

impl PendingReloads {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            files: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.files.insert(path);
        self.deadline.get_or_insert(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Take the collected files and clear the deadline.
    pub fn take(&mut self) -> Vec<PathBuf> {
        self.deadline = None;
        std::mem::take(&mut self.files).into_iter().collect()
    }
}

enum WatchEvent {
    Changed(PathBuf),
    Failed(String),
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Start watching `target` and reloading modules on `host`.
pub(crate) fn spawn(
    host: Weak<ModuleHost>,
    target: WatchTarget,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, HostError> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) if is_relevant(&event.kind) => {
                for path in event.paths {
                    let _ = tx.send(WatchEvent::Changed(path));
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(WatchEvent::Failed(e.to_string()));
            }
        })
        .map_err(|e| HostError::watcher(e.to_string()))?;

    watcher
        .watch(target.dir(), RecursiveMode::NonRecursive)
        .map_err(|e| HostError::watcher(format!("{}: {e}", target.dir().display())))?;

    info!(dir = %target.dir().display(), debounce_ms = debounce.as_millis(), "Reload watcher started");

    Ok(tokio::spawn(async move {
        // Dropping the watcher stops the notify thread.
        let _watcher = watcher;
        let mut pending = PendingReloads::new(debounce);

        loop {
            let deadline = pending.deadline();
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => match event {
                    Some(WatchEvent::Changed(path)) => {
                        let Some(host) = host.upgrade() else { break };
                        if target.accepts(&path, &host.config().module_extension) {
                            debug!(path = %path.display(), "Module file changed");
                            pending.push(path, Instant::now());
                        }
                    }
                    Some(WatchEvent::Failed(message)) => {
                        let Some(host) = host.upgrade() else { break };
                        warn!(error = %message, "File watcher error");
                        host.report_error(WATCHER_SOURCE, "watcher_error", &HostError::watcher(message));
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let Some(host) = host.upgrade() else { break };
                    reload_files(&host, pending.take()).await;
                }
            }
        }

        debug!("Reload watcher stopped");
    }))
}

/// Load every module behind `files`, reporting failures to the error callback.
pub(crate) async fn reload_files(host: &ModuleHost, files: Vec<PathBuf>) {
    for file in files {
        let Some(name) = module_name(&file) else {
            continue;
        };
        match host.load(&name).await {
            Ok(()) => info!(module = %name, "Module reloaded after file change"),
            Err(e) => {
                warn!(module = %name, error = %e, "Reload skipped, keeping previous pool");
                host.report_error(WATCHER_SOURCE, &name, &e);
            }
        }
    }
}
