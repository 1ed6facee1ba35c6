//! Streamable HTTP transport.
//!
//! Each client frame is POSTed to a single endpoint. The reply is either a
//! JSON body (one message or a batch), an event stream, or `202 Accepted`
//! with no body. The server assigns a session id on initialize; it rides on
//! every later request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sse::SseParser;
use super::{check_status, Inbox, InboxSender};
use crate::error::TransportError;

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP transport for MCP servers.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    inbox: Inbox,
    sender: InboxSender,
    cancel: CancellationToken,
    closed: AtomicBool,
    timeout: Duration,
}

impl StreamableHttpTransport {
    /// Create a transport for `url`. No request is made until the first send.
    pub fn new(
        client: reqwest::Client,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::Http(format!("invalid url '{}': {}", url, e)))?;
        let cancel = CancellationToken::new();
        let (inbox, sender) = Inbox::new(cancel.clone());

        Ok(Self {
            client,
            url,
            headers,
            session_id: Mutex::new(None),
            inbox,
            sender,
            cancel,
            closed: AtomicBool::new(false),
            timeout,
        })
    }

    /// Session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    pub async fn send(&self, message: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        debug!(message = message, "Posting message to MCP server");

        let session = self.session_id();
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string());
        if let Some(id) = &session {
            request = request.header(SESSION_HEADER, id.as_str());
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout_ms()))??;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && session.is_some() {
            warn!(url = %self.url, "MCP session expired");
            self.sender.finish(TransportError::SessionExpired);
            return Err(TransportError::SessionExpired);
        }
        check_status(status)?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.lock();
            if current.as_deref() != Some(id) {
                debug!(session = id, "MCP session assigned");
                *current = Some(id.to_string());
            }
        }

        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            tokio::spawn(drain_stream(response, self.sender.clone(), self.cancel.clone()));
            return Ok(());
        }

        let body = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout_ms()))??;
        deliver_json_body(&body, &self.sender)
    }

    pub async fn receive(&self) -> Result<String, TransportError> {
        self.inbox.next().await
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(url = %self.url, "Closing streamable HTTP transport");
        self.cancel.cancel();

        if let Some(session) = self.session_id() {
            end_session(self.client.clone(), self.url.clone(), self.headers.clone(), session, self.timeout).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbox.has_ended()
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session_id.get_mut().take() else {
            return;
        };
        // Dropped without close: end the session in the background if a runtime is around.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(end_session(
                self.client.clone(),
                self.url.clone(),
                self.headers.clone(),
                session,
                self.timeout,
            ));
        }
    }
}

/// Best-effort `DELETE` of a server session.
async fn end_session(client: reqwest::Client, url: Url, headers: HeaderMap, session: String, timeout: Duration) {
    let request = client.delete(url).headers(headers).header(SESSION_HEADER, session).send();
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(error = %e, "Session DELETE failed"),
        Err(_) => debug!("Session DELETE timed out"),
    }
}

/// Queue the frames of a JSON reply body. Batches are split into frames.
fn deliver_json_body(body: &str, sender: &InboxSender) -> Result<(), TransportError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(());
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::Protocol(format!("invalid JSON reply: {}", e)))?;
    match value {
        Value::Array(items) => {
            for item in items {
                sender.deliver(item.to_string());
            }
        }
        _ => {
            sender.deliver(body.to_string());
        }
    }
    Ok(())
}

async fn drain_stream(response: reqwest::Response, sender: InboxSender, cancel: CancellationToken) {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&bytes) {
                    if !matches!(event.event.as_deref(), None | Some("message")) {
                        continue;
                    }
                    if deliver_json_body(&event.data, &sender).is_err() {
                        warn!(data = %event.data, "Dropping malformed streamed frame");
                    }
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Reply stream ended with error");
                return;
            }
            None => return,
        }
    }
}
