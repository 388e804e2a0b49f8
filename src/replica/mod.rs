// ABOUTME: Replica side of the relay: long-poll the primary and install its snapshots
// ABOUTME: Exports SyncDaemon, SyncAttempt and the errors that end a sync

pub mod daemon;
pub mod replace;

pub use daemon::{DaemonConfig, SyncDaemon};
pub use replace::{AttemptError, Phase, ReplicaFiles, SyncAttempt};

use crate::remote::FailureCause;

/// Conditions that stop the replica for good.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Connection(FailureCause),
    #[error("upstream requires an authentication key to connect, provide via --auth-key")]
    AuthRequired,
    #[error("authentication key rejected by server, make sure it was entered correctly")]
    AuthRejected,
    #[error("unable to back up current sqlite database: {0:#}")]
    Backup(anyhow::Error),
}
