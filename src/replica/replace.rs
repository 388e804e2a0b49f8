// ABOUTME: One download-and-replace of the replica database
// ABOUTME: Stages the snapshot, backs up the live file, clears it and replays the snapshot

use anyhow::Context;
use sqlite_watcher::engine::Engine;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::remote::UpstreamClient;
use crate::utils::{copy_durably, exists, remove_if_exists, set_mode, with_suffix};

/// The live replica and the files that travel with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaFiles {
    pub live: PathBuf,
    /// Copy of the previous version, rewritten before every replace.
    pub old: PathBuf,
    /// Copy of whatever was there before the first sync, written once.
    pub orig: PathBuf,
    /// Downloaded snapshot waiting to be replayed.
    pub staging: PathBuf,
}

impl ReplicaFiles {
    pub fn new(live: impl Into<PathBuf>) -> Self {
        let live = live.into();
        Self {
            old: with_suffix(&live, ".old"),
            orig: with_suffix(&live, ".orig"),
            staging: with_suffix(&live, ".new.sql"),
            live,
        }
    }

    /// Save the pre-existing replica as `.orig` unless one is already there.
    /// Returns whether a copy was made.
    pub async fn backup_original(&self) -> anyhow::Result<bool> {
        if !exists(&self.live).await? || exists(&self.orig).await? {
            return Ok(false);
        }
        copy_durably(&self.live, &self.orig).await?;
        Ok(true)
    }
}

/// Step of a [`SyncAttempt`], in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    BackingUp,
    Unlocking,
    Clearing,
    Replaying,
    Sealing,
}

impl Phase {
    /// Failures before the live file is touched are worth another try.
    pub fn is_retryable(self) -> bool {
        matches!(self, Phase::Downloading | Phase::BackingUp | Phase::Unlocking)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Downloading => "downloading latest DB from upstream",
            Phase::BackingUp => "backing up current sqlite database",
            Phase::Unlocking => "making DB writable prior to import",
            Phase::Clearing => "dropping existing DB prior to import",
            Phase::Replaying => "importing newly downloaded DB",
            Phase::Sealing => "making DB read-only following import",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {cause:#}")]
pub struct AttemptError {
    pub phase: Phase,
    cause: anyhow::Error,
}

impl AttemptError {
    fn new(phase: Phase, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            phase,
            cause: cause.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.phase.is_retryable()
    }
}

/// Fetches the primary's snapshot and installs it over the replica.
pub struct SyncAttempt<'a> {
    files: &'a ReplicaFiles,
    engine: &'a dyn Engine,
}

impl<'a> SyncAttempt<'a> {
    pub fn new(files: &'a ReplicaFiles, engine: &'a dyn Engine) -> Self {
        Self { files, engine }
    }

    /// Download into staging, then install. Staging is gone afterwards
    /// whatever happened.
    pub async fn run(&self, client: &UpstreamClient) -> Result<(), AttemptError> {
        let result = self.download_and_install(client).await;
        if let Err(e) = remove_if_exists(&self.files.staging).await {
            tracing::warn!(
                "unable to remove staging file {}: {}",
                self.files.staging.display(),
                e
            );
        }
        result
    }

    async fn download_and_install(&self, client: &UpstreamClient) -> Result<(), AttemptError> {
        remove_if_exists(&self.files.staging)
            .await
            .context("unable to remove previous staging file")
            .map_err(|e| AttemptError::new(Phase::Downloading, e))?;
        let bytes = client
            .download_to(&self.files.staging)
            .await
            .map_err(|e| AttemptError::new(Phase::Downloading, e))?;
        tracing::debug!("downloaded {} bytes to {}", bytes, self.files.staging.display());
        self.install(&self.files.staging).await
    }

    /// Replace the live file's contents with the SQL script at `snapshot`.
    pub async fn install(&self, snapshot: &Path) -> Result<(), AttemptError> {
        let live = &self.files.live;
        let live_exists = exists(live)
            .await
            .map_err(|e| AttemptError::new(Phase::BackingUp, e))?;

        if live_exists {
            copy_durably(live, &self.files.old)
                .await
                .map_err(|e| AttemptError::new(Phase::BackingUp, e))?;
            set_mode(live, 0o600)
                .await
                .map_err(|e| AttemptError::new(Phase::Unlocking, e))?;
        }

        if let Err(err) = self.rebuild(live, snapshot).await {
            reseal(live).await;
            return Err(err);
        }

        set_mode(live, 0o400)
            .await
            .map_err(|e| AttemptError::new(Phase::Sealing, e))?;
        Ok(())
    }

    async fn rebuild(&self, live: &Path, snapshot: &Path) -> Result<(), AttemptError> {
        self.engine
            .clear(live)
            .await
            .map_err(|e| AttemptError::new(Phase::Clearing, e))?;
        self.engine
            .replay(live, snapshot)
            .await
            .map_err(|e| AttemptError::new(Phase::Replaying, e))
    }
}

/// Best effort: put a replica left behind by a failed rebuild back to read-only.
async fn reseal(live: &Path) {
    if !matches!(exists(live).await, Ok(true)) {
        return;
    }
    match set_mode(live, 0o400).await {
        Ok(()) => tracing::info!("restored read-only mode on {}", live.display()),
        Err(err) => tracing::warn!(
            "unable to restore read-only mode on {}: {:#}",
            live.display(),
            err
        ),
    }
}
