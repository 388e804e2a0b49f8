// ABOUTME: SyncDaemon for replicas - keeps a local SQLite file in step with a primary
// ABOUTME: Long-polls /watch and funnels every download through a single worker task

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlite_watcher::engine::Engine;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::replace::{ReplicaFiles, SyncAttempt};
use super::SyncError;
use crate::remote::diagnose;
use crate::remote::{PollOutcome, UpstreamClient};

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Wait before retrying a failed poll or download
    pub retry_delay: Duration,
    /// A watch request still open after this long counts as connected
    pub connect_grace: Duration,
    /// Keep a `.orig` copy of a pre-existing replica before the first sync
    pub backup_original: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            connect_grace: Duration::from_millis(400),
            backup_original: true,
        }
    }
}

/// Capacity-one queue of pending downloads. Requests made while one is
/// already queued are dropped.
#[derive(Clone)]
struct DownloadTrigger {
    tx: mpsc::Sender<()>,
}

impl DownloadTrigger {
    fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    fn request_after(&self, delay: Duration) {
        let trigger = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            trigger.request();
        });
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    initial_sync_done: bool,
}

/// SyncDaemon keeps one replica file in step with a primary.
///
/// The poll loop parks on `/watch`; each `modified` answer queues a download.
/// A single worker drains that queue, so at most one [`SyncAttempt`] runs at
/// any time, and bursts of notifications collapse into one extra download.
pub struct SyncDaemon {
    files: Arc<ReplicaFiles>,
    engine: Arc<dyn Engine>,
    client: Arc<UpstreamClient>,
    config: DaemonConfig,
}

impl SyncDaemon {
    pub fn new(
        db_path: impl Into<PathBuf>,
        engine: Arc<dyn Engine>,
        client: UpstreamClient,
        config: DaemonConfig,
    ) -> Self {
        Self {
            files: Arc::new(ReplicaFiles::new(db_path)),
            engine,
            client: Arc::new(client),
            config,
        }
    }

    pub fn files(&self) -> &ReplicaFiles {
        &self.files
    }

    /// Run until `shutdown` fires or a fatal condition is hit. An attempt in
    /// progress is allowed to finish before this returns.
    #[tracing::instrument(name = "sync", skip_all, fields(db = %self.files.live.display()))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let (tx, rx) = mpsc::channel(1);
        let trigger = DownloadTrigger { tx };
        let stop = shutdown.child_token();

        let worker = tokio::spawn(
            download_worker(
                Arc::clone(&self.files),
                Arc::clone(&self.engine),
                Arc::clone(&self.client),
                rx,
                trigger.clone(),
                self.config.retry_delay,
                stop.clone(),
            )
            .in_current_span(),
        );

        let mut state = ConnectionState::default();
        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = self.poll_loop(&trigger, &mut state) => result,
        };

        stop.cancel();
        if let Err(e) = worker.await {
            error!("download worker failed: {}", e);
        }
        result
    }

    async fn poll_loop(
        &self,
        trigger: &DownloadTrigger,
        state: &mut ConnectionState,
    ) -> Result<(), SyncError> {
        loop {
            self.poll_once(trigger, state).await?;
        }
    }

    async fn poll_once(
        &self,
        trigger: &DownloadTrigger,
        state: &mut ConnectionState,
    ) -> Result<(), SyncError> {
        let request = self.client.poll();
        tokio::pin!(request);

        let early = tokio::select! {
            outcome = &mut request => Some(outcome),
            _ = sleep(self.config.connect_grace) => None,
        };
        let outcome = match early {
            Some(outcome) => {
                if matches!(outcome, Ok(PollOutcome::Modified)) {
                    self.on_connected(trigger, state).await?;
                }
                outcome
            }
            None => {
                self.on_connected(trigger, state).await?;
                request.await
            }
        };

        match outcome {
            Ok(PollOutcome::Modified) => {
                if trigger.request() {
                    debug!("upstream changed, download queued");
                } else {
                    debug!("upstream changed, download already queued");
                }
                Ok(())
            }
            Ok(PollOutcome::Unauthorized) if self.client.has_auth_key() => {
                Err(SyncError::AuthRejected)
            }
            Ok(PollOutcome::Unauthorized) => Err(SyncError::AuthRequired),
            Ok(PollOutcome::Unexpected { status, body }) => {
                let cause = diagnose::classify_message(&body, self.client.uses_tls());
                if cause.is_fatal() {
                    return Err(SyncError::Connection(cause));
                }
                warn!(
                    "unknown body received from upstream (status {}): {:?}",
                    status,
                    body.trim()
                );
                self.back_off(state).await;
                Ok(())
            }
            Err(err) => {
                let cause = diagnose::classify(&err, self.client.uses_tls());
                if cause.is_fatal() {
                    return Err(SyncError::Connection(cause));
                }
                warn!(
                    "unable to watch for upstream updates, retrying in {:?}: {}",
                    self.config.retry_delay,
                    diagnose::error_chain(&err)
                );
                self.back_off(state).await;
                Ok(())
            }
        }
    }

    async fn on_connected(
        &self,
        trigger: &DownloadTrigger,
        state: &mut ConnectionState,
    ) -> Result<(), SyncError> {
        if !state.connected {
            info!("connected to upstream");
            state.connected = true;
        }
        if state.initial_sync_done {
            return Ok(());
        }
        state.initial_sync_done = true;

        if self.config.backup_original
            && self
                .files
                .backup_original()
                .await
                .map_err(SyncError::Backup)?
        {
            info!("syncing upstream DB to {}", self.files.live.display());
            info!(
                "if that's not what you meant to do, we've saved a backup at {}",
                self.files.orig.display()
            );
        }

        info!("running initial sync");
        trigger.request();
        Ok(())
    }

    async fn back_off(&self, state: &mut ConnectionState) {
        state.connected = false;
        sleep(self.config.retry_delay).await;
    }
}

async fn download_worker(
    files: Arc<ReplicaFiles>,
    engine: Arc<dyn Engine>,
    client: Arc<UpstreamClient>,
    mut requests: mpsc::Receiver<()>,
    trigger: DownloadTrigger,
    retry_delay: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            next = requests.recv() => {
                if next.is_none() {
                    break;
                }
            }
        }

        match SyncAttempt::new(&files, engine.as_ref()).run(&client).await {
            Ok(()) => info!("updated DB on disk with latest"),
            Err(err) if err.is_retryable() => {
                warn!("{}, retrying in {:?}", err, retry_delay);
                trigger.request_after(retry_delay);
            }
            Err(err) => error!("{}", err),
        }
    }
}
