//! Everything related to turning newly appended bytes into lines.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::probe::Identity;

/// Default size of a single read from disk.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// One complete line read from a tracked file.
///
/// The owning file is referenced by path and identity only; a `Line` does not
/// keep any file state alive.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Line {
    content: String,
    source: Arc<Path>,
    identity: Identity,
}

impl Line {
    pub(crate) fn new(content: String, source: Arc<Path>, identity: Identity) -> Self {
        Line {
            content,
            source,
            identity,
        }
    }

    /// The line's text, without its terminating newline.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Path of the file the line was read from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Identity of the physical file the line was read from.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn into_content(self) -> String {
        self.content
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("source", &self.source)
            .field("content", &self.content)
            .finish()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Complete lines found in an unread region, and where reading should resume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Reconstructed {
    pub lines: Vec<String>,
    /// Offset just past the last consumed newline. A trailing partial line
    /// starts here.
    pub cursor: u64,
}

/// Reads the unread tail of a file in fixed-size chunks and splits it into
/// newline-terminated lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineReconstructor {
    chunk_size: usize,
}

impl Default for LineReconstructor {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl LineReconstructor {
    /// A `chunk_size` of zero is bumped to one.
    pub fn new(chunk_size: usize) -> Self {
        LineReconstructor {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Reads bytes in `[cursor, known_size)` of `path` and returns every
    /// complete line in that region.
    ///
    /// A trailing segment without a newline is neither returned nor consumed,
    /// so it is re-read, and correctly prefixed, once the rest of the line
    /// has been written. The caller is responsible for resetting `cursor`
    /// when the file shrank; a `cursor` at or past `known_size` reads nothing.
    ///
    /// Only the disk reads are bounded by the chunk size. Every complete line
    /// found in the region, plus the trailing partial line, is held in memory
    /// until the call returns.
    pub(crate) async fn read_new_lines(
        &self,
        path: impl AsRef<Path>,
        cursor: u64,
        known_size: u64,
    ) -> io::Result<Reconstructed> {
        if cursor >= known_size {
            return Ok(Reconstructed {
                lines: Vec::new(),
                cursor,
            });
        }

        let mut file = File::open(path.as_ref()).await?;
        file.seek(io::SeekFrom::Start(cursor)).await?;

        let mut remaining = known_size - cursor;
        let mut chunk = vec![0u8; clamp_len(self.chunk_size, remaining)];
        let mut partial = Vec::new();
        let mut out = Reconstructed {
            lines: Vec::new(),
            cursor,
        };

        while remaining > 0 {
            let want = clamp_len(chunk.len(), remaining);
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                // Shrank between probe and read.
                break;
            }
            remaining -= n as u64;

            let mut rest = &chunk[..n];
            while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
                partial.extend_from_slice(&rest[..pos]);
                out.cursor += partial.len() as u64 + 1;
                out.lines.push(String::from_utf8_lossy(&partial).into_owned());
                partial.clear();
                rest = &rest[pos + 1..];
            }
            partial.extend_from_slice(rest);
        }

        Ok(out)
    }
}

fn clamp_len(len: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(len, |r| len.min(r))
}
