//! The authoritative map from watched path to its tracked file.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TailConfig;
use crate::events::{Notifier, RawEvent};
use crate::file::{Outcome, TrackedFile};
use crate::reader::LineReconstructor;
use crate::TailError;

/// Owns every [`TrackedFile`] and the notifier subscriptions backing them.
pub struct WatchRegistry<N> {
    notifier: N,
    files: HashMap<Arc<Path>, TrackedFile>,
    reader: LineReconstructor,
    resolve_retries: u32,
    resolve_backoff: Duration,
    shutdown: CancellationToken,
}

impl<N> Debug for WatchRegistry<N> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("WatchRegistry")
            .field("files", &self.files)
            .field("resolve_retries", &self.resolve_retries)
            .field("resolve_backoff", &self.resolve_backoff)
            .finish()
    }
}

impl<N: Notifier> WatchRegistry<N> {
    pub fn new(notifier: N, config: &TailConfig) -> Self {
        WatchRegistry {
            notifier,
            files: HashMap::new(),
            reader: config.reconstructor(),
            resolve_retries: config.resolve_retries,
            resolve_backoff: config.resolve_backoff,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ties rename resolution to an engine-wide shutdown signal.
    pub(crate) fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Starts tracking `path` from byte 0 and subscribes it with the
    /// notifier. A path that is already tracked is returned untouched.
    pub async fn add(&mut self, path: impl Into<PathBuf>) -> Result<&mut TrackedFile, TailError> {
        let path: PathBuf = path.into();
        let key: Arc<Path> = Arc::from(path);

        match self.files.entry(key) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let file = TrackedFile::open(slot.key().clone(), self.reader).await?;
                self.notifier.subscribe(file.path())?;
                debug!(path = %file.path().display(), size = file.size(), "Subscribed file");
                Ok(slot.insert(file))
            }
        }
    }

    /// Unsubscribes `path` and forgets it. Absent paths are a no-op.
    pub fn remove(&mut self, path: &Path) -> Result<Option<TrackedFile>, TailError> {
        match self.files.remove(path) {
            Some(file) => {
                self.release(path)?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Waits for a file to (re)appear at `path`, probing up to
    /// `resolve_retries` extra times with `resolve_backoff` in between.
    ///
    /// The result is not registered.
    pub async fn resolve(&mut self, path: &Path) -> Result<TrackedFile, TailError> {
        let mut attempt = 0;

        loop {
            match TrackedFile::open(path, self.reader).await {
                Ok(file) => return Ok(file),
                Err(e) if e.is_not_found() && attempt < self.resolve_retries => {
                    attempt += 1;
                    trace!(path = %path.display(), attempt, "Waiting for file to reappear");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(TailError::Cancelled),
                        _ = tokio::time::sleep(self.resolve_backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Classifies `event` against the file tracked at its path. Returns
    /// `None` when the path is not tracked.
    pub async fn dispatch(&mut self, event: RawEvent) -> Option<Outcome> {
        let file = match self.files.remove(event.path.as_path()) {
            Some(file) => file,
            None => {
                trace!(path = %event.path.display(), op = ?event.op, "Ignoring untracked path");
                return None;
            }
        };

        debug!(path = %event.path.display(), op = ?event.op, "Classifying event");
        Some(file.classify(event.op, self).await)
    }

    pub fn get(&self, path: &Path) -> Option<&TrackedFile> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(|k| &**k)
    }

    /// Subscribes and records an already-probed file, replacing any entry at
    /// the same path.
    pub(crate) fn track(&mut self, file: TrackedFile) -> Result<&mut TrackedFile, TailError> {
        self.notifier.subscribe(file.path())?;
        debug!(path = %file.path().display(), "Subscribed file");

        let slot = match self.files.entry(file.shared_path()) {
            Entry::Occupied(mut slot) => {
                slot.insert(file);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(file),
        };

        Ok(slot)
    }

    /// Puts back a file taken out by [`dispatch`](Self::dispatch) without
    /// touching its subscription.
    pub(crate) fn restore(&mut self, file: TrackedFile) {
        self.files.insert(file.shared_path(), file);
    }

    /// Drops the notifier subscription for `path` only.
    pub(crate) fn release(&mut self, path: &Path) -> Result<(), TailError> {
        debug!(path = %path.display(), "Unsubscribed file");
        self.notifier.unsubscribe(path)
    }
}
