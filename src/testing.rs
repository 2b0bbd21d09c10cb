//! In-memory notifier for unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::events::Notifier;
use crate::TailError;

#[derive(Debug, Default)]
struct FakeState {
    subscribed: HashSet<PathBuf>,
    refuse_subscribe: bool,
    unsubscribe_calls: usize,
}

/// Records subscriptions; clones share state so tests can inspect a notifier
/// after handing it to a registry.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeNotifier {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNotifier {
    pub(crate) fn is_subscribed(&self, path: &Path) -> bool {
        self.state.lock().unwrap().subscribed.contains(path)
    }

    pub(crate) fn subscribed_count(&self) -> usize {
        self.state.lock().unwrap().subscribed.len()
    }

    pub(crate) fn unsubscribe_calls(&self) -> usize {
        self.state.lock().unwrap().unsubscribe_calls
    }

    pub(crate) fn refuse_subscribe(&self) {
        self.state.lock().unwrap().refuse_subscribe = true;
    }
}

impl Notifier for FakeNotifier {
    fn subscribe(&mut self, path: &Path) -> Result<(), TailError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_subscribe {
            return Err(notify::Error::generic("subscribe refused").into());
        }
        state.subscribed.insert(path.to_path_buf());
        Ok(())
    }

    fn unsubscribe(&mut self, path: &Path) -> Result<(), TailError> {
        let mut state = self.state.lock().unwrap();
        state.unsubscribe_calls += 1;
        state.subscribed.remove(path);
        Ok(())
    }
}
