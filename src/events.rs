//! Everything related to receiving raw filesystem notifications for watched
//! files.

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind};
use tokio::sync::mpsc;

use crate::TailError;

/// Operation carried by a raw notification.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    Unknown,
}

impl Op {
    /// Classifies a `notify` event kind. Returns `None` for kinds that do not
    /// describe a change to the file (reads, opens, closes).
    pub fn from_kind(kind: &EventKind) -> Option<Op> {
        let op = match kind {
            EventKind::Access(_) => return None,
            EventKind::Create(_) => Op::Create,
            // kqueue and Windows report data changes as `Any`
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => Op::Write,
            EventKind::Modify(ModifyKind::Name(_)) => Op::Rename,
            EventKind::Modify(ModifyKind::Metadata(_)) => Op::Chmod,
            EventKind::Remove(_) => Op::Remove,
            EventKind::Modify(ModifyKind::Other) | EventKind::Any | EventKind::Other => Op::Unknown,
        };

        Some(op)
    }
}

/// A single notification naming one path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub op: Op,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        RawEvent {
            path: path.into(),
            op,
        }
    }

    /// Splits a `notify::Event` into one `RawEvent` per path it names.
    pub fn from_notify(event: notify::Event) -> Vec<RawEvent> {
        match Op::from_kind(&event.kind) {
            Some(op) => event
                .paths
                .into_iter()
                .map(|path| RawEvent { path, op })
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Stream of raw events (or notifier failures) feeding the engine.
pub type RawEvents = mpsc::UnboundedReceiver<Result<RawEvent, TailError>>;

/// Sending half matching [`RawEvents`].
pub type RawEventSender = mpsc::UnboundedSender<Result<RawEvent, TailError>>;

/// Subscription side of a file-change notifier.
///
/// Events for subscribed paths are delivered out of band on a [`RawEvents`]
/// receiver handed to the engine alongside the notifier.
pub trait Notifier: Send + 'static {
    fn subscribe(&mut self, path: &Path) -> Result<(), TailError>;

    /// Must succeed for paths that are not (or no longer) subscribed.
    fn unsubscribe(&mut self, path: &Path) -> Result<(), TailError>;
}

/// Notifier backed by the platform's recommended [`notify::Watcher`].
///
/// Each file is watched directly and non-recursively.
///
/// [`notify::Watcher`]: ../notify/trait.Watcher.html
pub struct NotifyBackend {
    inner: notify::RecommendedWatcher,
    watched_files: HashSet<PathBuf>,
}

impl Debug for NotifyBackend {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("NotifyBackend")
            .field("watched_files", &self.watched_files)
            .finish()
    }
}

impl NotifyBackend {
    /// Starts the watcher, returning it with the stream its events arrive on.
    pub fn new() -> Result<(Self, RawEvents), TailError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // `send` only fails once the engine has dropped the receiver, at
            // which point nobody is listening anyway.
            match res {
                Ok(event) => {
                    for raw in RawEvent::from_notify(event) {
                        let _ = tx.send(Ok(raw));
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(TailError::Notifier(e)));
                }
            }
        })?;

        let backend = NotifyBackend {
            inner,
            watched_files: HashSet::new(),
        };

        Ok((backend, rx))
    }
}

impl Notifier for NotifyBackend {
    fn subscribe(&mut self, path: &Path) -> Result<(), TailError> {
        if self.watched_files.contains(path) {
            return Ok(());
        }

        notify::Watcher::watch(&mut self.inner, path, notify::RecursiveMode::NonRecursive)?;
        self.watched_files.insert(path.to_path_buf());

        Ok(())
    }

    fn unsubscribe(&mut self, path: &Path) -> Result<(), TailError> {
        // Remove from the set first in case `unwatch` fails.
        if !self.watched_files.remove(path) {
            return Ok(());
        }

        match notify::Watcher::unwatch(&mut self.inner, path) {
            Ok(()) => Ok(()),
            // The OS drops the watch itself once the inode is deleted.
            Err(e) if matches!(e.kind, notify::ErrorKind::WatchNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cleans `path` to the canonical form used as the watch key.
///
/// The parent directory is resolved (symlinks followed, relative paths
/// anchored at the current directory) and the file name re-attached, so the
/// file itself need not be resolvable.
pub fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let dir = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
        .to_os_string();

    let dir = if let Ok(linked_dir) = dir.read_link() {
        linked_dir
    } else {
        dir
    };

    let dir = if let Ok(abs_dir) = dir.canonicalize() {
        abs_dir
    } else {
        dir
    };

    Ok(dir.join(filename))
}
