// ABOUTME: Filesystem helpers shared by the replica and the CLI
// ABOUTME: Durable copies, permission changes, staging cleanup and ~ expansion

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};

/// Copy `from` over `to` byte for byte and flush the copy to disk.
///
/// The destination is truncated first, so an older copy is fully replaced.
/// `to` is synced before returning, which makes it safe to use as a
/// recovery artifact even if the process dies right after.
///
/// # Errors
///
/// Returns an error if the source cannot be opened, the destination cannot
/// be created or written, or the final sync fails.
///
/// # Examples
///
/// ```no_run
/// # use sqlite_relay::utils::copy_durably;
/// # use std::path::Path;
/// # async fn demo() -> anyhow::Result<()> {
/// copy_durably(Path::new("replica.db"), Path::new("replica.db.old")).await?;
/// # Ok(())
/// # }
/// ```
pub async fn copy_durably(from: &Path, to: &Path) -> Result<u64> {
    let mut source = File::open(from)
        .await
        .with_context(|| format!("Failed to open {}", from.display()))?;
    let mut target = File::create(to)
        .await
        .with_context(|| format!("Failed to create {}", to.display()))?;
    let copied = tokio::io::copy(&mut source, &mut target)
        .await
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    target
        .sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", to.display()))?;
    Ok(copied)
}

/// Set unix permission bits on `path`. A no-op on other platforms.
pub async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("Failed to chmod {:o} {}", mode, path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether `path` exists. Errors other than "not found" are reported.
pub async fn exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a leading `~` are returned unchanged, as is `~` itself when
/// no home directory can be determined.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// `<path><suffix>`, keeping the full original file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
