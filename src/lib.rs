//! Incremental, rotation-aware tailing of text files.
//!
//! A [`TailEngine`] seeds a set of files, delivering the lines already in
//! them, and then turns every filesystem notification for those files into a
//! typed [`Change`] carrying exactly the complete lines appended since the
//! last one. Partial lines are held back until their newline arrives,
//! truncated or replaced files are read again from the start, and a file
//! rotated away and recreated under the same name is picked up again.
//!
//! ## Example
//!
//! ```no_run
//! use tailwatch::{ChangeKind, TailConfig, TailEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailwatch::TailError> {
//!     let engine = TailEngine::new(TailConfig::default())?;
//!     let mut tail = engine.start(["some/file.log", "/some/other/file.log"]).await?;
//!
//!     while let Some(change) = tail.next_change().await {
//!         if change.kind() == ChangeKind::Removed {
//!             println!("gone: {:?}", change.file().map(|f| f.path()));
//!         }
//!         for line in change.iter() {
//!             println!("source: {}, line: {}", line.source().display(), line.content());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Files must exist when tailing starts, and each file is watched directly
//! rather than through its parent directory. A path renamed away is polled
//! for a bounded time (see [`TailConfig`]) before it is given up on.

mod config;
mod engine;
mod error;
mod events;
mod file;
mod probe;
mod reader;
mod registry;
#[cfg(test)]
mod testing;

pub use config::TailConfig;
pub use engine::{EngineState, Tail, TailEngine};
pub use error::TailError;
pub use events::{absolutify, Notifier, NotifyBackend, Op, RawEvent, RawEventSender, RawEvents};
pub use file::{Change, ChangeKind, Outcome, TrackedFile};
pub use probe::{probe, Identity, Probe};
pub use reader::{Line, LineReconstructor, DEFAULT_CHUNK_SIZE};
pub use registry::WatchRegistry;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
