//! Server-Sent Events transport.
//!
//! A long-lived GET streams server frames; the first `endpoint` event names
//! the URL that client frames are POSTed to.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_status, Inbox, InboxSender};
use crate::error::TransportError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" line)
    pub event: Option<String>,
    /// The event data (from "data:" lines)
    pub data: String,
    /// The event ID (from "id:" line)
    pub id: Option<String>,
}

/// SSE parser that buffers partial lines across network chunks.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseParser {
    /// Create a new SSE parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and return any complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if let Some(event) = self.finalize_event() {
                    events.push(event);
                }
                continue;
            }

            // Lines starting with ':' are comments
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.current_event = Some(value.to_string()),
                "data" => self.current_data.push(value.to_string()),
                "id" => self.current_id = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn finalize_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            self.current_id = None;
            return None;
        }

        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

impl fmt::Debug for SseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseParser")
            .field("buffer_len", &self.buffer.len())
            .field("current_data_lines", &self.current_data.len())
            .finish()
    }
}

/// SSE transport for MCP servers.
pub struct SseTransport {
    client: reqwest::Client,
    /// URL that frames are POSTed to.
    endpoint: Url,
    headers: HeaderMap,
    inbox: Inbox,
    cancel: CancellationToken,
    closed: AtomicBool,
    timeout: Duration,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(
        client: reqwest::Client,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let timeout_ms = timeout.as_millis() as u64;
        let stream_url =
            Url::parse(url).map_err(|e| TransportError::Http(format!("invalid url '{}': {}", url, e)))?;

        debug!(url = %stream_url, "Opening SSE stream");

        let request = client
            .get(stream_url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(timeout_ms))??;
        check_status(response.status())?;

        let cancel = CancellationToken::new();
        let (inbox, sender) = Inbox::new(cancel.clone());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(pump(response, sender, endpoint_tx, cancel.clone()));

        // Stops the pump if this future is dropped or fails before the endpoint arrives.
        let pending = cancel.clone().drop_guard();

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(path)) => stream_url
                .join(&path)
                .map_err(|e| TransportError::Protocol(format!("invalid endpoint '{}': {}", path, e)))?,
            Ok(Err(_)) => {
                return Err(TransportError::Protocol(
                    "stream ended before the endpoint was announced".to_string(),
                ));
            }
            Err(_) => return Err(TransportError::Timeout(timeout_ms)),
        };
        let _ = pending.disarm();

        debug!(endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            client,
            endpoint,
            headers,
            inbox,
            cancel,
            closed: AtomicBool::new(false),
            timeout,
        })
    }

    /// URL that frames are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send(&self, message: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        debug!(message = message, "Posting message to MCP server");

        let request = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))??;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::SessionExpired);
        }
        check_status(response.status())
    }

    pub async fn receive(&self) -> Result<String, TransportError> {
        self.inbox.next().await
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(endpoint = %self.endpoint, "Closing SSE transport");
        self.cancel.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbox.has_ended()
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    response: reqwest::Response,
    sender: InboxSender,
    endpoint_tx: oneshot::Sender<String>,
    cancel: CancellationToken,
) {
    let mut endpoint_tx = Some(endpoint_tx);
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
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        None | Some("message") => {
                            debug!(message = %event.data, "Received message from MCP server");
                            if !sender.deliver(event.data) {
                                return;
                            }
                        }
                        Some(other) => debug!(event = other, "Ignoring SSE event"),
                    }
                }
            }
            Some(Err(e)) => {
                sender.finish(TransportError::Http(e.to_string()));
                return;
            }
            None => {
                sender.finish(TransportError::Closed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves an event stream that never announces an endpoint and reports
    /// whether the client hung up within two seconds.
    async fn silent_sse_server() -> (String, tokio::task::JoinHandle<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n: waiting\n\n")
                .await
                .unwrap();
            let hung_up = async {
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(2), hung_up).await.is_ok()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_abandoned_connect_releases_stream() {
        let (url, server) = silent_sse_server().await;
        let attempt = SseTransport::connect(reqwest::Client::new(), &url, HeaderMap::new(), Duration::from_secs(30));

        assert!(tokio::time::timeout(Duration::from_millis(300), attempt).await.is_err());
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_endpoint_timeout_releases_stream() {
        let (url, server) = silent_sse_server().await;
        let result = SseTransport::connect(reqwest::Client::new(), &url, HeaderMap::new(), Duration::from_millis(200)).await;

        assert!(matches!(result, Err(TransportError::Timeout(200))));
        assert!(server.await.unwrap());
    }

    #[test]
    fn test_endpoint_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /messages?sessionId=abc\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = SseParser::new();

        let events = parser.feed(b"event: message\ndata: {\"jsonrpc\":");
        assert!(events.is_empty());

        let events = parser.feed(b"\"2.0\",\"id\":1,\"result\":{}}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\nid: 9\ndata: line one\ndata: line two\n\n\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("9"));
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_relative_endpoint_resolution() {
        let stream = Url::parse("https://tools.example.com/mcp/sse").unwrap();
        let endpoint = stream.join("/messages?sessionId=abc").unwrap();
        assert_eq!(endpoint.as_str(), "https://tools.example.com/messages?sessionId=abc");

        let absolute = stream.join("https://other.example.com/post").unwrap();
        assert_eq!(absolute.host_str(), Some("other.example.com"));
    }
}
