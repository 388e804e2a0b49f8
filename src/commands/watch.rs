// ABOUTME: Primary role: serve /watch and /latest for one database file
// ABOUTME: Wires the sqlite3 engine, TLS material, notification server and change watcher together

use anyhow::{bail, Context, Result};
use sqlite_watcher::change::{ChangeWatcher, ChangeWatcherConfig};
use sqlite_watcher::engine::{Engine, SqliteShell};
use sqlite_watcher::registry::SubscriberRegistry;
use sqlite_watcher::server::NotificationServer;
use sqlite_watcher::tls::{default_tls_dir, generate_self_signed, load_acceptor, TlsFiles};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::utils::exists;

pub async fn watch(settings: &Settings, shutdown: CancellationToken) -> Result<()> {
    let db = &settings.sync_file;
    if !exists(db)
        .await
        .with_context(|| format!("Failed to inspect {}", db.display()))?
    {
        bail!("Database file {} does not exist", db.display());
    }

    let engine: Arc<dyn Engine> = Arc::new(SqliteShell::locate(
        settings.sqlite3.as_deref(),
        settings.engine_timeout,
    )?);
    let registry = SubscriberRegistry::new();

    let mut server = NotificationServer::new(
        db,
        Arc::clone(&engine),
        Arc::clone(&registry),
        settings.auth_key.clone(),
    );
    if settings.use_ssl {
        let files = tls_files(settings)?;
        server = server.with_tls(load_acceptor(&files)?);
    }
    if settings.auth_key.is_none() {
        tracing::warn!("no auth key configured, anyone who can reach this port can read the database");
    }

    let handle = server.bind(settings.bind_socket_addr()?, shutdown.clone()).await?;

    let watcher = ChangeWatcher::new(
        db,
        engine,
        registry,
        ChangeWatcherConfig {
            min_interval: settings.sync_interval,
        },
    );
    let result = watcher.run(shutdown).await;
    handle.stop().await;
    result
}

fn tls_files(settings: &Settings) -> Result<TlsFiles> {
    if let (Some(cert), Some(key)) = (&settings.ssl_cert_file, &settings.ssl_key_file) {
        return Ok(TlsFiles {
            cert: cert.clone(),
            key: key.clone(),
        });
    }

    let dir = default_tls_dir()?;
    tracing::warn!(
        "ssl cert file and key file weren't specified, generating a self-signed pair in {}",
        dir.display()
    );
    generate_self_signed(&dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, RelayArgs};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn settings(db: PathBuf) -> Settings {
        Settings::merge(&RelayArgs::default(), FileConfig::default(), Some(db), None).unwrap()
    }

    #[tokio::test]
    async fn refuses_to_watch_a_missing_file() {
        let dir = tempdir().unwrap();
        let err = watch(&settings(dir.path().join("absent.db")), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn missing_engine_binary_is_fatal() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("present.db");
        std::fs::write(&db, b"").unwrap();
        let mut settings = settings(db);
        settings.sqlite3 = Some(dir.path().join("no-such-sqlite3"));

        let err = watch(&settings, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no-such-sqlite3"));
    }

    #[test]
    fn explicit_tls_files_are_used_as_given() {
        let mut settings = settings(PathBuf::from("/data/app.db"));
        settings.ssl_cert_file = Some(PathBuf::from("/etc/relay/cert.pem"));
        settings.ssl_key_file = Some(PathBuf::from("/etc/relay/key.pem"));

        let files = tls_files(&settings).unwrap();
        assert_eq!(files.cert, PathBuf::from("/etc/relay/cert.pem"));
        assert_eq!(files.key, PathBuf::from("/etc/relay/key.pem"));
    }
}
