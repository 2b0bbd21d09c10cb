//! Error kinds surfaced by probing, reading and watching.

use std::io;
use std::path::{Path, PathBuf};

/// Errors produced while tailing files.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    /// The path does not exist (at probe or resolve time).
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Permission failure on stat or read.
    #[error("Permission denied: {}", .0.display())]
    AccessDenied(PathBuf),

    /// The path names something other than a regular file.
    #[error("Not a file: {}", .0.display())]
    NotAFile(PathBuf),

    /// Read failure mid-stream.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Subscription or stream failure from the notifier.
    #[error("Notifier error: {0}")]
    Notifier(#[from] notify::Error),

    /// The engine was shut down while the operation was in progress.
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl TailError {
    /// Classifies an `io::Error` raised while touching `path`.
    pub fn from_io(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => TailError::NotFound(path),
            io::ErrorKind::PermissionDenied => TailError::AccessDenied(path),
            _ => TailError::Io { path, source: err },
        }
    }

    /// Returns `true` for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TailError::NotFound(_))
    }
}
