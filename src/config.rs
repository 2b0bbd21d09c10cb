//! Tunables for the tailing engine.

use std::time::Duration;

use crate::reader::{LineReconstructor, DEFAULT_CHUNK_SIZE};

/// Configuration for [`TailEngine`](crate::TailEngine).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TailConfig {
    /// Upper bound on a single read from disk.
    pub read_chunk_size: usize,
    /// How many times a renamed-away path is re-probed before giving up.
    pub resolve_retries: u32,
    /// Delay between those probes.
    pub resolve_backoff: Duration,
    /// Bound of the outbound change channel.
    pub change_capacity: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            resolve_retries: 5,
            resolve_backoff: Duration::from_secs(1),
            change_capacity: 64,
        }
    }
}

impl TailConfig {
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn with_resolve_retries(mut self, retries: u32) -> Self {
        self.resolve_retries = retries;
        self
    }

    pub fn with_resolve_backoff(mut self, backoff: Duration) -> Self {
        self.resolve_backoff = backoff;
        self
    }

    pub fn with_change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity;
        self
    }

    pub(crate) fn reconstructor(&self) -> LineReconstructor {
        LineReconstructor::new(self.read_chunk_size)
    }

    /// `tokio::sync::mpsc::channel` panics on zero capacity.
    pub(crate) fn channel_capacity(&self) -> usize {
        self.change_capacity.max(1)
    }
}
