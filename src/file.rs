//! Per-file read state and classification of raw events into changes.

use std::path::Path;
use std::slice::Iter;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{Notifier, Op};
use crate::probe::{probe, Identity};
use crate::reader::{Line, LineReconstructor};
use crate::registry::WatchRegistry;
use crate::TailError;

/// A file under observation: its identity, last known size, and how far its
/// content has been delivered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackedFile {
    path: Arc<Path>,
    identity: Identity,
    size: u64,
    cursor: u64,
    reader: LineReconstructor,
}

impl TrackedFile {
    /// Probes `path` and starts tracking it from byte 0.
    pub async fn open(
        path: impl Into<Arc<Path>>,
        reader: LineReconstructor,
    ) -> Result<Self, TailError> {
        let path: Arc<Path> = path.into();
        let probed = probe(&*path).await?;

        Ok(TrackedFile {
            path,
            identity: probed.identity,
            size: probed.size,
            cursor: 0,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<Path> {
        Arc::clone(&self.path)
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Size as of the last probe.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset up to which content has been delivered as complete lines.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Re-probes the file. A shrunken file, or a different file now living
    /// at the same path, is read again from byte 0.
    pub async fn refresh_size(&mut self) -> Result<(), TailError> {
        let probed = probe(&*self.path).await?;

        if probed.identity != self.identity {
            warn!(
                path = %self.path.display(),
                "File replaced under the same path, reading from start"
            );
            self.identity = probed.identity;
            self.cursor = 0;
        } else if probed.size < self.cursor {
            warn!(
                path = %self.path.display(),
                old_cursor = self.cursor,
                new_size = probed.size,
                "File truncated, resetting cursor to 0"
            );
            self.cursor = 0;
        }
        self.size = probed.size;

        Ok(())
    }

    /// Returns every complete line appended since the last call.
    pub async fn pull_new_lines(&mut self) -> Result<Vec<Line>, TailError> {
        self.refresh_size().await?;

        let out = self
            .reader
            .read_new_lines(&*self.path, self.cursor, self.size)
            .await
            .map_err(|e| TailError::from_io(&*self.path, e))?;
        self.cursor = out.cursor;

        let lines = out
            .lines
            .into_iter()
            .map(|content| Line::new(content, self.shared_path(), self.identity))
            .collect();

        Ok(lines)
    }

    /// Turns one raw event into a [`Change`].
    ///
    /// The file must already have been taken out of `registry`; it is put
    /// back unless the event ends its tracking.
    pub(crate) async fn classify<N: Notifier>(
        self,
        op: Op,
        registry: &mut WatchRegistry<N>,
    ) -> Outcome {
        match op {
            // Content of a new file arrives with the Write that follows.
            Op::Create => self.keep(ChangeKind::Created, registry),
            Op::Write => self.on_written(registry).await,
            Op::Remove => self.on_removed(registry),
            Op::Rename => self.on_renamed(registry).await,
            Op::Chmod => self.keep(ChangeKind::PermissionChanged, registry),
            Op::Unknown => self.keep(ChangeKind::Unknown, registry),
        }
    }

    fn keep<N: Notifier>(self, kind: ChangeKind, registry: &mut WatchRegistry<N>) -> Outcome {
        let change = Change::new(kind, Some(self.clone()), Vec::new());
        registry.restore(self);
        Outcome::from(change)
    }

    async fn on_written<N: Notifier>(mut self, registry: &mut WatchRegistry<N>) -> Outcome {
        let pulled = self.pull_new_lines().await;
        let snapshot = self.clone();
        registry.restore(self);

        match pulled {
            Ok(lines) => Outcome::from(Change::new(ChangeKind::Written, Some(snapshot), lines)),
            Err(e) => Outcome::from(Change::new(ChangeKind::Written, Some(snapshot), Vec::new()))
                .with_error(e),
        }
    }

    fn on_removed<N: Notifier>(self, registry: &mut WatchRegistry<N>) -> Outcome {
        let released = registry.release(&self.path);
        debug!(path = %self.path.display(), "Stopped tracking removed file");

        let outcome = Outcome::from(Change::new(ChangeKind::Removed, Some(self), Vec::new()));
        match released {
            Ok(()) => outcome,
            Err(e) => outcome.with_error(e),
        }
    }

    async fn on_renamed<N: Notifier>(self, registry: &mut WatchRegistry<N>) -> Outcome {
        let mut errors = Vec::new();
        if let Err(e) = registry.release(&self.path) {
            errors.push(e);
        }

        let mut fresh = match registry.resolve(&self.path).await {
            Ok(fresh) => fresh,
            Err(e) => {
                debug!(path = %self.path.display(), "Renamed file was not recreated");
                errors.push(e);
                return Outcome {
                    change: Change::new(ChangeKind::Renamed, None, Vec::new()),
                    errors,
                };
            }
        };

        // A write queued ahead of the rename may already have switched us to
        // the recreated file and delivered its content.
        if fresh.identity == self.identity {
            fresh.cursor = self.cursor;
        }

        // Subscribe before reading so a write racing the read still notifies.
        let file = match registry.track(fresh) {
            Ok(file) => file,
            Err(e) => {
                errors.push(e);
                return Outcome {
                    change: Change::new(ChangeKind::Renamed, None, Vec::new()),
                    errors,
                };
            }
        };

        let lines = match file.pull_new_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                errors.push(e);
                Vec::new()
            }
        };
        debug!(
            path = %file.path.display(),
            lines = lines.len(),
            "Tracking recreated file"
        );

        Outcome {
            change: Change::new(ChangeKind::Renamed, Some(file.clone()), lines),
            errors,
        }
    }
}

/// What happened to a tracked file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChangeKind {
    Created,
    Written,
    Renamed,
    Removed,
    PermissionChanged,
    Unknown,
}

/// One observable event, with the lines it made available.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    kind: ChangeKind,
    file: Option<TrackedFile>,
    lines: Vec<Line>,
}

impl Change {
    pub(crate) fn new(kind: ChangeKind, file: Option<TrackedFile>, lines: Vec<Line>) -> Self {
        Change { kind, file, lines }
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// State of the file the change concerns, as of the change. `None` for a
    /// rename whose path never reappeared.
    pub fn file(&self) -> Option<&TrackedFile> {
        self.file.as_ref()
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Returns an iterator over the lines.
    pub fn iter(&self) -> Iter<'_, Line> {
        self.lines.iter()
    }

    /// Returns the number of lines carried.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if no lines are carried.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line contents in order.
    pub fn contents(&self) -> Vec<&str> {
        self.lines.iter().map(Line::content).collect()
    }

    pub fn into_lines(self) -> Vec<Line> {
        self.lines
    }
}

impl IntoIterator for Change {
    type Item = Line;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}

/// A classified event: always one change, plus any per-file errors met while
/// producing it.
#[derive(Debug)]
pub struct Outcome {
    pub change: Change,
    pub errors: Vec<TailError>,
}

impl Outcome {
    fn with_error(mut self, err: TailError) -> Self {
        self.errors.push(err);
        self
    }
}

impl From<Change> for Outcome {
    fn from(change: Change) -> Self {
        Outcome {
            change,
            errors: Vec::new(),
        }
    }
}
