//! Startup seeding and the worker that turns raw notifications into changes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::task;

use futures_util::stream::Stream as FuturesStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::events::{absolutify, Notifier, NotifyBackend, RawEvents};
use crate::file::{Change, ChangeKind};
use crate::registry::WatchRegistry;
use crate::TailError;

/// Lifecycle of a [`TailEngine`]. Transitions only move forward.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EngineState {
    Idle,
    Seeding,
    Running,
    Stopped,
}

/// Seeds a set of files, then classifies every notification for them into a
/// [`Change`] on a single worker task.
///
/// ## Example
///
/// ```no_run
/// use tailwatch::{TailConfig, TailEngine};
///
/// # async fn run() -> Result<(), tailwatch::TailError> {
/// let engine = TailEngine::new(TailConfig::default())?;
/// let mut tail = engine.start(["/var/log/app.log"]).await?;
///
/// while let Some(change) = tail.next_change().await {
///     for line in change.lines() {
///         println!("{}: {}", line.source().display(), line.content());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct TailEngine<N: Notifier = NotifyBackend> {
    config: TailConfig,
    registry: WatchRegistry<N>,
    raw_events: RawEvents,
    state: watch::Sender<EngineState>,
    shutdown: CancellationToken,
}

impl<N: Notifier> std::fmt::Debug for TailEngine<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl TailEngine<NotifyBackend> {
    /// Builds an engine on the platform's native file watcher.
    pub fn new(config: TailConfig) -> Result<Self, TailError> {
        let (notifier, raw_events) = NotifyBackend::new()?;
        Ok(Self::with_notifier(config, notifier, raw_events))
    }
}

impl<N: Notifier> TailEngine<N> {
    /// Builds an engine on any notifier. `raw_events` must carry the events
    /// for paths subscribed through `notifier`.
    pub fn with_notifier(config: TailConfig, notifier: N, raw_events: RawEvents) -> Self {
        let shutdown = CancellationToken::new();
        let registry = WatchRegistry::new(notifier, &config).with_shutdown(shutdown.clone());
        let (state, _) = watch::channel(EngineState::Idle);

        TailEngine {
            config,
            registry,
            raw_events,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Registers and reads every path, then hands the engine to a worker
    /// task.
    ///
    /// Any seed failure aborts startup: the notifier is released and the
    /// error returned. On success the first changes delivered are one
    /// `Created` change per distinct path, in order, carrying the file's
    /// existing content.
    pub async fn start<I, P>(mut self, paths: I) -> Result<Tail, TailError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.transition(EngineState::Seeding);

        let seeds = match self.seed(paths).await {
            Ok(seeds) => seeds,
            Err(e) => {
                warn!(error = %e, "Seeding failed");
                self.finish();
                return Err(e);
            }
        };

        let (change_tx, change_rx) = mpsc::channel(self.config.channel_capacity());
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let state = self.state.subscribe();
        let shutdown = self.shutdown.clone();

        let worker = tokio::spawn(self.run(seeds, change_tx, error_tx));

        Ok(Tail {
            changes: change_rx,
            errors: error_rx,
            state,
            shutdown,
            worker: Some(worker),
        })
    }

    async fn seed<I, P>(&mut self, paths: I) -> Result<Vec<Change>, TailError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut seen = HashSet::new();
        let mut seeds = Vec::new();

        for path in paths {
            let raw: PathBuf = path.into();
            let path = absolutify(raw.clone()).map_err(|e| TailError::from_io(&raw, e))?;
            if !seen.insert(path.clone()) {
                continue;
            }

            let file = self.registry.add(path).await?;
            let lines = file.pull_new_lines().await?;
            debug!(
                path = %file.path().display(),
                lines = lines.len(),
                "Seeded file"
            );

            seeds.push(Change::new(ChangeKind::Created, Some(file.clone()), lines));
        }

        Ok(seeds)
    }

    async fn run(
        mut self,
        seeds: Vec<Change>,
        changes: mpsc::Sender<Change>,
        errors: mpsc::UnboundedSender<TailError>,
    ) {
        for change in seeds {
            if !deliver(&self.shutdown, &changes, change).await {
                self.finish();
                return;
            }
        }

        self.transition(EngineState::Running);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    break;
                }
                next = self.raw_events.recv() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "Notifier failed, stopping");
                    let _ = errors.send(e);
                    break;
                }
                None => {
                    debug!("Notifier event stream ended");
                    break;
                }
            };

            let outcome = match self.registry.dispatch(event).await {
                Some(outcome) => outcome,
                None => continue,
            };

            for e in outcome.errors {
                warn!(error = %e, "Error while handling file event");
                let _ = errors.send(e);
            }

            if !deliver(&self.shutdown, &changes, outcome.change).await {
                break;
            }
        }

        self.finish();
    }

    fn transition(&self, next: EngineState) {
        info!(state = ?next, "Tail engine state");
        self.state.send_replace(next);
    }

    /// Releases the notifier and event stream before announcing `Stopped`.
    fn finish(self) {
        let TailEngine {
            registry,
            raw_events,
            state,
            ..
        } = self;
        drop(raw_events);
        drop(registry);

        info!(state = ?EngineState::Stopped, "Tail engine state");
        state.send_replace(EngineState::Stopped);
    }
}

/// Blocks until the consumer accepts `change`. Returns `false` once delivery
/// is pointless: shutdown, or the consumer is gone.
async fn deliver(
    shutdown: &CancellationToken,
    changes: &mpsc::Sender<Change>,
    change: Change,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = changes.send(change) => sent.is_ok(),
    }
}

/// Consumer side of a running [`TailEngine`].
///
/// Changes arrive in the order their raw events were observed. Per-file
/// errors arrive separately, on [`next_error`](Tail::next_error). Dropping the
/// handle shuts the engine down.
#[derive(Debug)]
pub struct Tail {
    changes: mpsc::Receiver<Change>,
    errors: mpsc::UnboundedReceiver<TailError>,
    state: watch::Receiver<EngineState>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Tail {
    /// Waits for the next change. `None` once the engine has stopped and all
    /// pending changes were received.
    pub async fn next_change(&mut self) -> Option<Change> {
        self.changes.recv().await
    }

    /// Waits for the next error. `None` once the engine has stopped and all
    /// pending errors were received.
    pub async fn next_error(&mut self) -> Option<TailError> {
        self.errors.recv().await
    }

    pub fn try_next_error(&mut self) -> Option<TailError> {
        self.errors.try_recv().ok()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub async fn wait_stopped(&mut self) {
        loop {
            if *self.state.borrow_and_update() == EngineState::Stopped {
                return;
            }
            // The sender only goes away after announcing `Stopped`.
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Asks the worker to stop. In-flight reads complete first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stops the worker and waits for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl FuturesStream for Tail {
    type Item = Change;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.get_mut().changes.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Op, RawEvent, RawEventSender};
    use crate::testing::FakeNotifier;
    use futures_util::stream::StreamExt;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine(notifier: FakeNotifier) -> (TailEngine<FakeNotifier>, RawEventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = TailConfig::default()
            .with_resolve_retries(2)
            .with_resolve_backoff(Duration::from_millis(10));
        (TailEngine::with_notifier(config, notifier, rx), tx)
    }

    fn logfile(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().canonicalize().unwrap().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    async fn next(tail: &mut Tail) -> Change {
        timeout(TIMEOUT, tail.next_change())
            .await
            .expect("timed out waiting for change")
            .expect("change stream closed")
    }

    #[tokio::test]
    async fn test_seed_delivers_existing_content() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"x\ny\n");

        let (engine, _tx) = engine(FakeNotifier::default());
        assert_eq!(engine.state(), EngineState::Idle);
        let mut tail = engine.start([&path]).await.unwrap();

        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Created);
        assert_eq!(change.contents(), vec!["x", "y"]);
        assert_eq!(change.file().unwrap().path(), path.as_path());
        assert_eq!(change.file().unwrap().cursor(), 4);
    }

    #[tokio::test]
    async fn test_seed_order_and_duplicates() {
        let dir = tempdir().unwrap();
        let a = logfile(&dir, "a.log", b"a\n");
        let b = logfile(&dir, "b.log", b"");

        let notifier = FakeNotifier::default();
        let (engine, _tx) = engine(notifier.clone());
        let mut tail = engine.start([&b, &a, &b]).await.unwrap();

        let first = next(&mut tail).await;
        assert_eq!(first.file().unwrap().path(), b.as_path());
        assert!(first.is_empty());
        let second = next(&mut tail).await;
        assert_eq!(second.file().unwrap().path(), a.as_path());
        assert_eq!(second.contents(), vec!["a"]);

        assert_eq!(notifier.subscribed_count(), 2);
    }

    #[tokio::test]
    async fn test_seed_missing_file_is_fatal() {
        let dir = tempdir().unwrap();
        let good = logfile(&dir, "a.log", b"a\n");

        let (engine, _tx) = engine(FakeNotifier::default());
        let err = engine
            .start([good, dir.path().join("missing.log")])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_seed_subscribe_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"a\n");

        let notifier = FakeNotifier::default();
        notifier.refuse_subscribe();
        let (engine, _tx) = engine(notifier);

        let err = engine.start([path]).await.unwrap_err();
        assert!(matches!(err, TailError::Notifier(_)));
    }

    #[tokio::test]
    async fn test_written_events_deliver_lines() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path]).await.unwrap();
        assert!(next(&mut tail).await.is_empty());

        append(&path, b"abc");
        tx.send(Ok(RawEvent::new(path.clone(), Op::Write))).unwrap();
        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Written);
        assert!(change.is_empty());

        append(&path, b"def\n");
        tx.send(Ok(RawEvent::new(path.clone(), Op::Write))).unwrap();
        let change = next(&mut tail).await;
        assert_eq!(change.contents(), vec!["abcdef"]);
        assert_eq!(tail.state(), EngineState::Running);
    }

    #[tokio::test]
    async fn test_untracked_events_are_ignored() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path]).await.unwrap();
        next(&mut tail).await;

        tx.send(Ok(RawEvent::new(dir.path().join("other.log"), Op::Write)))
            .unwrap();
        tx.send(Ok(RawEvent::new(path.clone(), Op::Chmod))).unwrap();

        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::PermissionChanged);
    }

    #[tokio::test]
    async fn test_rename_without_recreate() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"a\n");
        let other = logfile(&dir, "b.log", b"");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path, &other]).await.unwrap();
        next(&mut tail).await;
        next(&mut tail).await;

        std::fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        tx.send(Ok(RawEvent::new(path.clone(), Op::Rename))).unwrap();

        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Renamed);
        assert!(change.file().is_none());
        let err = timeout(TIMEOUT, tail.next_error()).await.unwrap().unwrap();
        assert!(err.is_not_found());

        // No longer tracked: this is skipped, the next one is delivered.
        tx.send(Ok(RawEvent::new(path.clone(), Op::Write))).unwrap();
        tx.send(Ok(RawEvent::new(other.clone(), Op::Unknown))).unwrap();
        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Unknown);
        assert_eq!(change.file().unwrap().path(), other.as_path());
        assert!(tail.try_next_error().is_none());
    }

    #[tokio::test]
    async fn test_rename_with_recreate() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"old\n");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path]).await.unwrap();
        let seeded = next(&mut tail).await;
        let old_identity = seeded.file().unwrap().identity();

        std::fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        std::fs::write(&path, b"new-1\n").unwrap();
        tx.send(Ok(RawEvent::new(path.clone(), Op::Rename))).unwrap();

        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Renamed);
        assert_eq!(change.contents(), vec!["new-1"]);
        let new_identity = change.file().unwrap().identity();
        #[cfg(unix)]
        assert_ne!(new_identity, old_identity);
        let _ = old_identity;

        append(&path, b"new-2\n");
        tx.send(Ok(RawEvent::new(path.clone(), Op::Write))).unwrap();
        let change = next(&mut tail).await;
        assert_eq!(change.contents(), vec!["new-2"]);
        assert_eq!(change.file().unwrap().identity(), new_identity);
        assert!(change.iter().all(|l| l.identity() == new_identity));
    }

    #[tokio::test]
    async fn test_remove_stops_tracking() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"");

        let notifier = FakeNotifier::default();
        let (engine, tx) = engine(notifier.clone());
        let mut tail = engine.start([&path]).await.unwrap();
        next(&mut tail).await;

        std::fs::remove_file(&path).unwrap();
        tx.send(Ok(RawEvent::new(path.clone(), Op::Remove))).unwrap();
        let change = next(&mut tail).await;
        assert_eq!(change.kind(), ChangeKind::Removed);
        assert!(!notifier.is_subscribed(&path));
    }

    #[tokio::test]
    async fn test_notifier_error_stops_engine() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path]).await.unwrap();
        next(&mut tail).await;

        tx.send(Err(notify::Error::generic("inotify queue overflow").into()))
            .unwrap();

        let err = timeout(TIMEOUT, tail.next_error()).await.unwrap().unwrap();
        assert!(matches!(err, TailError::Notifier(_)));
        assert!(timeout(TIMEOUT, tail.next_change()).await.unwrap().is_none());
        timeout(TIMEOUT, tail.wait_stopped()).await.unwrap();
        assert_eq!(tail.state(), EngineState::Stopped);
        // Surfaced exactly once.
        assert!(timeout(TIMEOUT, tail.next_error()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"x\n");

        let (engine, tx) = engine(FakeNotifier::default());
        let mut tail = engine.start([&path]).await.unwrap();
        next(&mut tail).await;

        tail.shutdown();
        timeout(TIMEOUT, tail.wait_stopped()).await.unwrap();
        assert!(timeout(TIMEOUT, tail.next()).await.unwrap().is_none());

        // The worker is gone, so nothing is listening anymore.
        assert!(tx.send(Ok(RawEvent::new(path, Op::Write))).is_err());
    }

    #[tokio::test]
    async fn test_stop_joins_worker() {
        let dir = tempdir().unwrap();
        let path = logfile(&dir, "a.log", b"");

        let (engine, _tx) = engine(FakeNotifier::default());
        let tail = engine.start([&path]).await.unwrap();
        timeout(TIMEOUT, tail.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_consumes_as_stream() {
        let dir = tempdir().unwrap();
        let a = logfile(&dir, "a.log", b"1\n");
        let b = logfile(&dir, "b.log", b"2\n3\n");

        let (engine, tx) = engine(FakeNotifier::default());
        let tail = engine.start([&a, &b]).await.unwrap();
        drop(tx);

        let lines: Vec<String> = timeout(
            TIMEOUT,
            tail.flat_map(|change| futures_util::stream::iter(change.into_iter()))
                .map(|line| line.into_content())
                .collect(),
        )
        .await
        .unwrap();
        assert_eq!(lines, vec!["1", "2", "3"]);
    }
}
