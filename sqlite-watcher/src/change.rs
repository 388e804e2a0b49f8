use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::fingerprint::{has_changed, Fingerprint};
use crate::registry::SubscriberRegistry;

/// Body delivered to every parked watch request when the database changes.
pub const MODIFIED_MESSAGE: &str = "modified\n";

#[derive(Debug, Clone, Copy)]
pub struct ChangeWatcherConfig {
    /// Minimum time between two fingerprint checks (and so between two
    /// notifications).
    pub min_interval: Duration,
}

impl Default for ChangeWatcherConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Modified,
    Renamed,
    Deleted,
}

/// Collapse notify's event taxonomy into what the watcher cares about.
pub fn classify_event(kind: &EventKind) -> Option<FileEvent> {
    match kind {
        EventKind::Remove(_) => Some(FileEvent::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileEvent::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileEvent::Modified),
        _ => None,
    }
}

/// Turns raw filesystem events for one database file into at most one
/// broadcast per real content change.
pub struct ChangeWatcher {
    db_path: PathBuf,
    engine: Arc<dyn Engine>,
    registry: Arc<SubscriberRegistry>,
    config: ChangeWatcherConfig,
}

impl ChangeWatcher {
    pub fn new(
        db_path: impl Into<PathBuf>,
        engine: Arc<dyn Engine>,
        registry: Arc<SubscriberRegistry>,
        config: ChangeWatcherConfig,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            engine,
            registry,
            config,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Watch the file with the platform notifier until it is deleted, the
    /// watch fails, or `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("failed to create file watcher")?;
        watcher
            .watch(&self.db_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.db_path.display()))?;

        info!("watching {}", self.db_path.display());
        let result = self.run_with_events(raw_rx, shutdown).await;
        drop(watcher);
        result
    }

    /// Core loop, fed by any source of notify events.
    #[tracing::instrument(name = "watch", skip_all, fields(db = %self.db_path.display()))]
    pub async fn run_with_events(
        self,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let initial = Fingerprint::of_database(self.engine.as_ref(), &self.db_path).await?;
        debug!(fingerprint = ?initial, "initial fingerprint computed");

        // One pending check at most; anything arriving while it is queued is
        // already covered by it.
        let (check_tx, check_rx) = mpsc::channel::<()>(1);
        let mut checker = tokio::spawn(check_loop(
            self.db_path.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            self.config.min_interval,
            initial,
            check_rx,
        ));

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                joined = &mut checker => {
                    break match joined {
                        Ok(result) => result,
                        Err(err) => Err(anyhow!("fingerprint task failed: {err}")),
                    };
                }
                event = events.recv() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(err)) => break Err(err).context("error watching file"),
                        None => break Err(anyhow!("file watcher stopped delivering events")),
                    };
                    match classify_event(&event.kind) {
                        Some(FileEvent::Deleted) => {
                            warn!("watched DB was deleted, exiting");
                            break Err(anyhow!("{} was deleted", self.db_path.display()));
                        }
                        Some(FileEvent::Renamed) => {
                            warn!("watched DB was renamed, watching may no longer work");
                        }
                        Some(FileEvent::Modified) => {
                            if check_tx.try_send(()).is_err() {
                                debug!("fingerprint check already queued");
                            }
                        }
                        None => {}
                    }
                }
            }
        };

        checker.abort();
        outcome
    }
}

async fn check_loop(
    db_path: PathBuf,
    engine: Arc<dyn Engine>,
    registry: Arc<SubscriberRegistry>,
    min_interval: Duration,
    mut last: Option<Fingerprint>,
    mut pending: mpsc::Receiver<()>,
) -> Result<()> {
    while pending.recv().await.is_some() {
        let current = Fingerprint::of_database(engine.as_ref(), &db_path).await?;

        if !has_changed(last, current) {
            debug!("watched DB was modified, but checksum is the same, not notifying clients");
        } else {
            last = current;
            match registry.broadcast(MODIFIED_MESSAGE) {
                0 => info!("watched DB was modified, but no clients to notify"),
                notified => info!(
                    "watched DB was modified, notified connected clients ({})",
                    notified
                ),
            }
        }

        tokio::time::sleep(min_interval).await;
    }

    bail!("fingerprint queue closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::FileCopyEngine;
    use notify::event::{DataChange, RemoveKind, RenameMode};
    use tempfile::tempdir;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    struct Harness {
        _dir: tempfile::TempDir,
        db: PathBuf,
        engine: Arc<FileCopyEngine>,
        registry: Arc<SubscriberRegistry>,
        events: mpsc::UnboundedSender<notify::Result<Event>>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    async fn start(interval_ms: u64) -> Harness {
        let dir = tempdir().unwrap();
        let db = dir.path().join("primary.db");
        std::fs::write(&db, b"CREATE TABLE t(x);\n").unwrap();
        let engine = Arc::new(FileCopyEngine::default());
        let registry = SubscriberRegistry::new();
        let (events, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let watcher = ChangeWatcher::new(
            &db,
            engine.clone(),
            registry.clone(),
            ChangeWatcherConfig {
                min_interval: Duration::from_millis(interval_ms),
            },
        );
        let task = tokio::spawn(watcher.run_with_events(rx, shutdown.clone()));
        while engine.dump_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        Harness {
            _dir: dir,
            db,
            engine,
            registry,
            events,
            shutdown,
            task,
        }
    }

    fn modified() -> notify::Result<Event> {
        Ok(Event::new(EventKind::Modify(ModifyKind::Data(
            DataChange::Content,
        ))))
    }

    #[test]
    fn classifies_notify_events() {
        assert_eq!(
            classify_event(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(FileEvent::Modified)
        );
        assert_eq!(
            classify_event(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(FileEvent::Renamed)
        );
        assert_eq!(
            classify_event(&EventKind::Remove(RemoveKind::File)),
            Some(FileEvent::Deleted)
        );
        assert_eq!(
            classify_event(&EventKind::Access(notify::event::AccessKind::Any)),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_events_is_checked_at_most_once_per_interval() {
        let h = start(400).await;
        assert_eq!(h.engine.dump_count(), 1, "initial fingerprint only");

        for _ in 0..50 {
            h.events.send(modified()).unwrap();
        }

        sleep(Duration::from_millis(200)).await;
        let first_window = h.engine.dump_count() - 1;
        assert_eq!(first_window, 1);

        sleep(Duration::from_millis(700)).await;
        let total = h.engine.dump_count() - 1;
        assert!((1..=2).contains(&total), "checks: {total}");

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unchanged_content_does_not_notify() {
        let h = start(10).await;
        let mut sub = h.registry.register();

        h.events.send(modified()).unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
        assert_eq!(h.registry.len(), 1);
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn changed_content_notifies_every_subscriber_once() {
        let h = start(10).await;
        let mut a = h.registry.register();
        let mut b = h.registry.register();

        std::fs::write(&h.db, b"CREATE TABLE t(x);\nINSERT INTO t VALUES(1);\n").unwrap();
        h.events.send(modified()).unwrap();

        let got_a = timeout(Duration::from_secs(2), a.recv()).await.unwrap();
        let got_b = timeout(Duration::from_secs(2), b.recv()).await.unwrap();
        assert_eq!(got_a.as_deref(), Some(MODIFIED_MESSAGE));
        assert_eq!(got_b.as_deref(), Some(MODIFIED_MESSAGE));

        // Same content again: a fresh subscriber stays parked.
        let mut c = h.registry.register();
        h.events.send(modified()).unwrap();
        assert!(timeout(Duration::from_millis(150), c.recv()).await.is_err());

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restarted_watcher_does_not_renotify_unchanged_file() {
        let first = start(10).await;
        first.shutdown.cancel();
        first.task.await.unwrap().unwrap();

        let registry = SubscriberRegistry::new();
        let engine = Arc::new(FileCopyEngine::default());
        let (events, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let watcher = ChangeWatcher::new(
            &first.db,
            engine,
            registry.clone(),
            ChangeWatcherConfig {
                min_interval: Duration::from_millis(10),
            },
        );
        let task = tokio::spawn(watcher.run_with_events(rx, shutdown.clone()));
        let mut sub = registry.register();

        events.send(modified()).unwrap();
        assert!(timeout(Duration::from_millis(150), sub.recv()).await.is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn delete_event_stops_the_watcher() {
        let h = start(10).await;
        h.events
            .send(Ok(Event::new(EventKind::Remove(RemoveKind::File))))
            .unwrap();
        let err = timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("deleted"));
    }

    #[tokio::test]
    async fn rename_event_keeps_watching() {
        let h = start(10).await;
        h.events
            .send(Ok(Event::new(EventKind::Modify(ModifyKind::Name(
                RenameMode::Both,
            )))))
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!h.task.is_finished());
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreadable_file_is_fatal() {
        let h = start(10).await;
        std::fs::remove_file(&h.db).unwrap();
        h.events.send(modified()).unwrap();

        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn notifier_error_is_fatal() {
        let h = start(10).await;
        h.events
            .send(Err(notify::Error::generic("inotify queue overflow")))
            .unwrap();
        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(result.is_err());
    }
}
