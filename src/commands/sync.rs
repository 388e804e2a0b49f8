// ABOUTME: Replica role: keep a local read-only copy of a primary's database
// ABOUTME: Builds the upstream client and hands off to SyncDaemon

use anyhow::{anyhow, Context, Result};
use sqlite_watcher::engine::SqliteShell;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::remote::{ClientOptions, UpstreamClient};
use crate::replica::{DaemonConfig, SyncDaemon};

pub async fn sync(settings: &Settings, shutdown: CancellationToken) -> Result<()> {
    let remote = settings
        .remote_conn
        .as_deref()
        .ok_or_else(|| anyhow!("No remote given (pass host:port as an argument or set remote_conn)"))?;

    if let Some(parent) = settings
        .sync_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let engine = SqliteShell::locate(settings.sqlite3.as_deref(), settings.engine_timeout)?;
    let client = UpstreamClient::new(
        remote,
        ClientOptions {
            use_tls: settings.use_ssl,
            skip_verify: settings.skip_ssl_verify,
            auth_key: settings.auth_key.clone(),
        },
    )?;

    tracing::info!(
        "syncing {} from {}",
        settings.sync_file.display(),
        client.watch_url()
    );

    let daemon = SyncDaemon::new(
        &settings.sync_file,
        Arc::new(engine),
        client,
        DaemonConfig {
            backup_original: !settings.no_backup,
            ..Default::default()
        },
    );
    daemon.run(shutdown).await?;
    Ok(())
}
