use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::registry::SubscriberRegistry;

/// Dumps smaller than this are sent uncompressed even when gzip is accepted.
pub const GZIP_MIN_BYTES: usize = 1000;

/// Body sent to a plaintext client that reached the TLS listener.
pub const PLAINTEXT_TO_TLS_BODY: &str = "Client sent an HTTP request to an HTTPS server.\n";

const TLS_HANDSHAKE: u8 = 0x16;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const PLAINTEXT_DRAIN_LIMIT: usize = 8 * 1024;
const PLAINTEXT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct ServerState {
    db_path: Arc<PathBuf>,
    engine: Arc<dyn Engine>,
    registry: Arc<SubscriberRegistry>,
    auth_key: Option<Arc<str>>,
}

impl ServerState {
    fn authorize(&self, headers: &HeaderMap, remote: &str) -> Result<(), Response> {
        let Some(expected) = self.auth_key.as_deref() else {
            return Ok(());
        };
        let provided = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if provided == Some(expected) {
            return Ok(());
        }
        warn!(
            "rejected connection from {}, {} auth key provided",
            remote,
            if provided.is_some() { "incorrect" } else { "no" }
        );
        Err((StatusCode::UNAUTHORIZED, "authorization required\n").into_response())
    }
}

/// Serves `/watch` (long-poll until the database changes) and `/latest`
/// (full dump) for one database file.
pub struct NotificationServer {
    state: ServerState,
    tls: Option<TlsAcceptor>,
}

impl NotificationServer {
    pub fn new(
        db_path: impl Into<PathBuf>,
        engine: Arc<dyn Engine>,
        registry: Arc<SubscriberRegistry>,
        auth_key: Option<String>,
    ) -> Self {
        Self {
            state: ServerState {
                db_path: Arc::new(db_path.into()),
                engine,
                registry,
                auth_key: auth_key.filter(|k| !k.is_empty()).map(Arc::from),
            },
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/watch", get(watch))
            .route("/latest", get(latest))
            .with_state(self.state.clone())
    }

    /// Bind `addr` and serve until `shutdown` fires or the handle is stopped.
    pub async fn bind(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr().context("listener has no local address")?;

        if self.tls.is_some() {
            info!("listening for SSL connections on {}", local_addr);
        } else {
            info!("listening on {}", local_addr);
        }

        let token = shutdown.child_token();
        let task = tokio::spawn(accept_loop(listener, self.router(), self.tls, token.clone()));

        Ok(ServerHandle {
            local_addr,
            shutdown: token,
            task: Some(task),
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every open connection and wait for the listener.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("failed to accept connection: {}", err);
                    if accept_backoff(&shutdown).await {
                        continue;
                    }
                    break;
                }
            },
        };

        let app = app.clone().layer(Extension(ConnectInfo(peer)));
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match first_byte(&stream).await {
                    Some(TLS_HANDSHAKE) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, app, shutdown).await,
                        Err(err) => {
                            debug!("tls handshake with {} failed: {}", peer, err);
                            return;
                        }
                    },
                    Some(_) => {
                        warn!("rejected plaintext request from {} on a TLS listener", peer);
                        if let Err(err) = reject_plaintext(stream).await {
                            debug!("failed to answer plaintext client {}: {}", peer, err);
                        }
                        return;
                    }
                    None => return,
                },
                None => serve_connection(stream, app, shutdown).await,
            };
            if let Err(err) = result {
                debug!("connection with {} ended: {}", peer, err);
            }
        });
    }
}

/// Pauses after a failed accept. Returns false if shutdown arrived meanwhile.
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn first_byte(stream: &TcpStream) -> Option<u8> {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(1) => Some(byte[0]),
        _ => None,
    }
}

// A replica without TLS gets a readable 400 instead of a reset. The request
// head is read first so closing the socket does not reset the connection
// before the client sees the response.
async fn reject_plaintext(mut stream: TcpStream) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let _ = tokio::time::timeout(PLAINTEXT_DRAIN_TIMEOUT, async {
        while head.len() < PLAINTEXT_DRAIN_LIMIT && !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;

    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        PLAINTEXT_TO_TLS_BODY.len(),
        PLAINTEXT_TO_TLS_BODY
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

// Dropping the connection future (client gone or shutdown) drops any
// in-flight handler, and with it the handler's subscription.
async fn serve_connection<S>(
    stream: S,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::select! {
        result = conn => result,
        _ = shutdown.cancelled() => Ok(()),
    }
}

fn remote_label(peer: &Option<ConnectInfo<SocketAddr>>) -> String {
    match peer {
        Some(ConnectInfo(addr)) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

struct DisconnectLog<'a>(&'a str);

impl Drop for DisconnectLog<'_> {
    fn drop(&mut self) {
        debug!("remote syncer {} disconnected", self.0);
    }
}

async fn watch(
    State(state): State<ServerState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let remote = remote_label(&peer);
    if let Err(rejection) = state.authorize(&headers, &remote) {
        return rejection;
    }

    let mut subscription = state.registry.register();
    debug!("remote syncer {} connected", remote);
    let _log = DisconnectLog(&remote);

    match subscription.recv().await {
        Some(message) => message.into_response(),
        None => StatusCode::OK.into_response(),
    }
}

async fn latest(
    State(state): State<ServerState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let remote = remote_label(&peer);
    if let Err(rejection) = state.authorize(&headers, &remote) {
        return rejection;
    }

    debug!("sending DB to {}", remote);
    let dump = match state.engine.dump(&state.db_path).await {
        Ok(dump) => dump,
        Err(err) => {
            error!("unable to dump {}: {}", state.db_path.display(), err);
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    if !accepts_gzip(&headers) || dump.len() < GZIP_MIN_BYTES {
        return dump.into_response();
    }

    match gzip(&dump) {
        Ok(body) => ([(CONTENT_ENCODING, "gzip")], body).into_response(),
        Err(err) => {
            error!("unable to gzip sqlite output: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("gzip"))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
