//! MCP transport implementations.
//!
//! Every transport exchanges whole JSON-RPC frames. Inbound frames are
//! pumped by a background task into an [`Inbox`]; `close` cancels that task
//! and guarantees nothing more is delivered through `receive`.

mod http;
mod sse;
mod stdio;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcphub_core::{AuthConfig, ServerDescriptor, TransportConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;

pub use http::StreamableHttpTransport;
pub use sse::{SseEvent, SseParser, SseTransport};
pub use stdio::StdioTransport;

/// Default header for API-key credentials.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Trait for MCP transport implementations.
///
/// Methods take `&self` so a connection can send while its reader task is
/// parked in `receive`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to the server.
    async fn send(&self, message: &str) -> Result<(), TransportError>;

    /// Receive the next frame. An error means the stream has ended; the
    /// error carries the reason.
    async fn receive(&self) -> Result<String, TransportError>;

    /// Close the transport. Idempotent.
    async fn close(&self);

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// One of the three concrete transports.
pub enum TransportHandle {
    /// Local subprocess.
    Stdio(StdioTransport),
    /// SSE stream plus POSTs.
    Sse(SseTransport),
    /// Streamable HTTP session.
    StreamableHttp(StreamableHttpTransport),
}

#[async_trait]
impl Transport for TransportHandle {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        match self {
            Self::Stdio(t) => t.send(message).await,
            Self::Sse(t) => t.send(message).await,
            Self::StreamableHttp(t) => t.send(message).await,
        }
    }

    async fn receive(&self) -> Result<String, TransportError> {
        match self {
            Self::Stdio(t) => t.receive().await,
            Self::Sse(t) => t.receive().await,
            Self::StreamableHttp(t) => t.receive().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Stdio(t) => t.close().await,
            Self::Sse(t) => t.close().await,
            Self::StreamableHttp(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Stdio(t) => t.is_connected(),
            Self::Sse(t) => t.is_connected(),
            Self::StreamableHttp(t) => t.is_connected(),
        }
    }
}

/// Opens transports for descriptors.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport to the server described by `descriptor`.
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Factory that dispatches on the descriptor's transport kind.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    shutdown_grace: Duration,
    client: reqwest::Client,
}

impl DefaultTransportFactory {
    /// Create a factory; `shutdown_grace` bounds how long a subprocess may
    /// take to exit after SIGTERM.
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        let timeout = descriptor.settings.connection_timeout();
        debug!(server = %descriptor.name, kind = %descriptor.transport.kind(), "Opening transport");

        let handle = match &descriptor.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                working_dir,
            } => {
                let mut env = env.clone();
                if let AuthConfig::ApiKey {
                    key,
                    env_var: Some(var),
                    ..
                } = &descriptor.auth
                {
                    env.insert(var.clone(), key.clone());
                }
                TransportHandle::Stdio(StdioTransport::spawn(
                    command,
                    args,
                    &env,
                    working_dir.as_deref(),
                    self.shutdown_grace,
                )?)
            }
            TransportConfig::Sse { url, headers } => {
                let headers = build_headers(headers, &descriptor.auth)?;
                TransportHandle::Sse(SseTransport::connect(self.client.clone(), url, headers, timeout).await?)
            }
            TransportConfig::StreamableHttp { url, headers } => {
                let headers = build_headers(headers, &descriptor.auth)?;
                TransportHandle::StreamableHttp(StreamableHttpTransport::new(
                    self.client.clone(),
                    url,
                    headers,
                    timeout,
                )?)
            }
        };

        Ok(Arc::new(handle))
    }
}

/// Build request headers from configured extras plus credentials.
pub(crate) fn build_headers(
    extra: &std::collections::BTreeMap<String, String>,
    auth: &AuthConfig,
) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in extra {
        insert_header(&mut headers, name, value)?;
    }

    match auth {
        AuthConfig::None => {}
        AuthConfig::ApiKey { key, header, .. } => {
            let name = header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
            insert_header(&mut headers, name, key)?;
        }
        AuthConfig::Bearer { token } => {
            insert_header(&mut headers, AUTHORIZATION.as_str(), &format!("Bearer {}", token))?;
        }
        AuthConfig::OAuth { access_token, .. } => match access_token {
            Some(token) => {
                insert_header(&mut headers, AUTHORIZATION.as_str(), &format!("Bearer {}", token))?;
            }
            None => {
                return Err(TransportError::AuthRejected(
                    "OAuth server has no access token; authorize it first".to_string(),
                ))
            }
        },
    }

    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), TransportError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::Http(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::Http(format!("invalid value for header '{}': {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

/// Map an HTTP status to a transport error, if it is one.
pub(crate) fn check_status(status: reqwest::StatusCode) -> Result<(), TransportError> {
    match status.as_u16() {
        401 | 403 => Err(TransportError::AuthRejected(format!("HTTP {}", status))),
        _ if status.is_success() => Ok(()),
        _ => Err(TransportError::Http(format!("unexpected status {}", status))),
    }
}

/// Receiving half of a transport's inbound queue.
pub(crate) struct Inbox {
    rx: Mutex<mpsc::UnboundedReceiver<Result<String, TransportError>>>,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
}

/// Sending half, held by pump tasks.
#[derive(Clone)]
pub(crate) struct InboxSender {
    tx: mpsc::UnboundedSender<Result<String, TransportError>>,
    ended: Arc<AtomicBool>,
}

impl Inbox {
    /// Create an inbox tied to `cancel`.
    pub(crate) fn new(cancel: CancellationToken) -> (Self, InboxSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ended = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx: Mutex::new(rx),
                cancel,
                ended: Arc::clone(&ended),
            },
            InboxSender { tx, ended },
        )
    }

    /// Next inbound frame, or the reason the stream ended.
    pub(crate) async fn next(&self) -> Result<String, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            item = rx.recv() => match item {
                _ if self.cancel.is_cancelled() => Err(TransportError::Closed),
                Some(item) => item,
                None => Err(TransportError::Closed),
            },
        }
    }

    /// Whether the pump has reported the end of the stream.
    pub(crate) fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl InboxSender {
    /// Queue a frame. Returns false once nobody is listening.
    pub(crate) fn deliver(&self, frame: String) -> bool {
        self.tx.send(Ok(frame)).is_ok()
    }

    /// Record the end of the stream.
    pub(crate) fn finish(&self, reason: TransportError) {
        self.ended.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Err(reason));
    }
}
