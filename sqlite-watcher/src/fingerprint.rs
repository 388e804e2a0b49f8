use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::engine::Engine;

/// SHA-256 over the logical (dumped) content of a database.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Fingerprint the dumped content of `db`.
    ///
    /// The outer error means the file itself could not be inspected and is
    /// fatal for a watcher. `Ok(None)` means the engine failed to dump it; the
    /// caller should treat the file as changed.
    pub async fn of_database(engine: &dyn Engine, db: &Path) -> Result<Option<Self>> {
        tokio::fs::metadata(db)
            .await
            .with_context(|| format!("failed to read {}", db.display()))?;

        match engine.dump(db).await {
            Ok(content) => Ok(Some(Self::of_bytes(&content))),
            Err(err) => {
                tracing::warn!(
                    db = %db.display(),
                    error = %err,
                    "unable to fingerprint database, assuming it changed"
                );
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Whether `current` should be announced, given what was last announced.
/// An unknown fingerprint on either side counts as a change.
pub fn has_changed(last: Option<Fingerprint>, current: Option<Fingerprint>) -> bool {
    match (last, current) {
        (Some(last), Some(current)) => last != current,
        _ => true,
    }
}
