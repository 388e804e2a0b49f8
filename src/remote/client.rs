// ABOUTME: HTTP client for talking to a primary's /watch and /latest endpoints
// ABOUTME: Sends the shared auth key, accepts gzip, and streams snapshots to disk

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Body the primary sends when the watched database changed.
pub const MODIFIED_BODY: &str = "modified";

/// How to reach the primary.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub use_tls: bool,
    pub skip_verify: bool,
    pub auth_key: Option<String>,
}

/// What a completed `/watch` request told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Modified,
    Unauthorized,
    Unexpected { status: u16, body: String },
}

pub struct UpstreamClient {
    client: Client,
    watch_url: Url,
    latest_url: Url,
    options: ClientOptions,
}

impl UpstreamClient {
    /// `remote` is `host:port`; the scheme comes from `options.use_tls`.
    pub fn new(remote: &str, options: ClientOptions) -> Result<Self> {
        if remote.contains("://") {
            bail!(
                "Remote '{}' should be given as host:port (use --ssl for https)",
                remote
            );
        }
        let scheme = if options.use_tls { "https" } else { "http" };
        let base = Url::parse(&format!("{}://{}/", scheme, remote))
            .with_context(|| format!("Invalid remote address '{}'", remote))?;
        let watch_url = base.join("watch").context("Failed to build watch URL")?;
        let latest_url = base.join("latest").context("Failed to build latest URL")?;

        // No overall timeout: a watch request legitimately waits for as long
        // as the primary stays unchanged.
        let client = Client::builder()
            .gzip(true)
            .danger_accept_invalid_certs(options.skip_verify)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            watch_url,
            latest_url,
            options,
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.options.use_tls
    }

    pub fn has_auth_key(&self) -> bool {
        self.options.auth_key.is_some()
    }

    pub fn watch_url(&self) -> &Url {
        &self.watch_url
    }

    fn get(&self, url: &Url) -> RequestBuilder {
        let request = self.client.get(url.clone());
        match &self.options.auth_key {
            Some(key) => request.header(AUTHORIZATION, key),
            None => request,
        }
    }

    /// Park on `/watch` until the primary answers.
    pub async fn poll(&self) -> Result<PollOutcome, reqwest::Error> {
        let response = self.get(&self.watch_url).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(PollOutcome::Unauthorized);
        }
        let body = response.text().await?;
        if status.is_success() && body.trim() == MODIFIED_BODY {
            Ok(PollOutcome::Modified)
        } else {
            Ok(PollOutcome::Unexpected {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Stream `/latest` into `path`, replacing anything already there.
    pub async fn download_to(&self, path: &Path) -> Result<u64> {
        let response = self
            .get(&self.latest_url)
            .send()
            .await
            .context("Failed to request latest snapshot")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Upstream returned {} for latest snapshot: {}",
                status,
                body.trim()
            );
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut written = 0u64;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.context("Failed while downloading latest snapshot")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", path.display()))?;
        Ok(written)
    }
}
