//! Size and identity queries against the filesystem.

use std::fs::Metadata;
use std::path::Path;

use tokio::fs::metadata;

use crate::TailError;

/// Stable token identifying a physical file rather than its name.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Identity {
    device: u64,
    inode: u64,
}

impl Identity {
    /// Device number the file lives on.
    pub fn device(&self) -> u64 {
        self.device
    }

    /// Inode number (or the closest equivalent on the platform).
    pub fn inode(&self) -> u64 {
        self.inode
    }

    #[cfg(unix)]
    fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Identity {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    // No stable inode outside unix; creation time is the best available
    // stand-in for "same physical file".
    #[cfg(not(unix))]
    fn from_metadata(meta: &Metadata) -> Self {
        let inode = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        Identity { device: 0, inode }
    }
}

/// Result of a single [`probe`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Probe {
    pub identity: Identity,
    pub size: u64,
}

/// Queries the current identity and byte length of `path`.
///
/// Always hits the filesystem; nothing is cached.
pub async fn probe(path: impl AsRef<Path>) -> Result<Probe, TailError> {
    let path = path.as_ref();
    let meta = metadata(path)
        .await
        .map_err(|e| TailError::from_io(path, e))?;

    if !meta.is_file() {
        return Err(TailError::NotAFile(path.to_path_buf()));
    }

    Ok(Probe {
        identity: Identity::from_metadata(&meta),
        size: meta.len(),
    })
}
