//! MCP client connection.
//!
//! [`McpConnection`] speaks JSON-RPC over one transport. A reader task
//! demultiplexes inbound frames: responses complete pending requests,
//! server requests are answered, and list-changed notifications are
//! forwarded to whoever supervises the connection. When the transport ends,
//! every pending request fails at once instead of waiting for its timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcphub_core::Scope;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, InvocationError, TransportError};
use crate::protocol::{
    methods, CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Inbound, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Page, ReadResourceParams,
    ReadResourceResult, RequestId, ServerCapabilities, MAX_LIST_PAGES,
};
use crate::registry::{Capabilities, ResourceInfo};
use crate::transport::Transport;

type PendingMap = HashMap<RequestId, oneshot::Sender<Result<Value, JsonRpcError>>>;

/// Failure of a single request, before it is classified for the caller.
#[derive(Debug)]
enum RequestError {
    Transport(TransportError),
    Rpc(JsonRpcError),
    Timeout(u64),
    Decode(String),
}

impl RequestError {
    fn into_handshake(self, method: &str) -> HandshakeError {
        match self {
            Self::Transport(TransportError::AuthRejected(msg)) => HandshakeError::AuthRejected(msg),
            Self::Transport(e) => HandshakeError::Transport(e),
            Self::Rpc(e) => HandshakeError::ServerError {
                code: e.code,
                message: e.message,
            },
            Self::Timeout(ms) => HandshakeError::Timeout(ms),
            Self::Decode(detail) => HandshakeError::schema(method, detail),
        }
    }
}

impl From<RequestError> for InvocationError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Transport(e) => e.into(),
            RequestError::Rpc(e) => InvocationError::ServerError {
                code: e.code,
                message: e.message,
            },
            RequestError::Timeout(ms) => InvocationError::Timeout(ms),
            RequestError::Decode(detail) => InvocationError::Malformed(detail),
        }
    }
}

/// A live JSON-RPC session with one MCP server.
pub struct McpConnection {
    /// Server name, for logs.
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
    request_counter: AtomicU64,
    /// Bound for every request.
    timeout: Duration,
    /// Why the connection ended, once it has.
    loss: Arc<Mutex<Option<TransportError>>>,
    /// Cancelled when the connection ends for any reason.
    lost: CancellationToken,
    server_capabilities: Mutex<Option<ServerCapabilities>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl McpConnection {
    /// Start a connection over an open transport.
    ///
    /// List-changed notification methods are sent to `notices`.
    pub fn start(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        notices: Option<mpsc::UnboundedSender<String>>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            name: name.into(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_counter: AtomicU64::new(1),
            timeout,
            loss: Arc::new(Mutex::new(None)),
            lost: CancellationToken::new(),
            server_capabilities: Mutex::new(None),
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(
            connection.name.clone(),
            Arc::clone(&connection.transport),
            Arc::clone(&connection.pending),
            Arc::clone(&connection.loss),
            connection.lost.clone(),
            notices,
        ));
        *connection.reader.lock() = Some(reader);

        connection
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connection is still usable.
    pub fn is_alive(&self) -> bool {
        !self.lost.is_cancelled() && self.transport.is_connected()
    }

    /// Wait until the connection ends.
    pub async fn closed(&self) {
        self.lost.cancelled().await
    }

    /// Why the connection ended.
    pub fn loss_reason(&self) -> TransportError {
        self.loss.lock().clone().unwrap_or(TransportError::Closed)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::from(self.request_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Send a request and wait for its result, bounded by the connection timeout.
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value, RequestError> {
        let deadline = Instant::now() + self.timeout;
        let id = self.next_request_id();
        let frame = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))
            .map_err(|e| RequestError::Decode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        if self.lost.is_cancelled() {
            self.pending.lock().remove(&id);
            return Err(RequestError::Transport(self.loss_reason()));
        }

        match tokio::time::timeout_at(deadline, self.transport.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.lock().remove(&id);
                return Err(RequestError::Transport(e));
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(RequestError::Timeout(self.timeout_ms()));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(RequestError::Rpc(error)),
            Ok(Err(_)) => Err(RequestError::Transport(self.loss_reason())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RequestError::Timeout(self.timeout_ms()))
            }
        }
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<R, RequestError> {
        let value = self.request_value(method, params).await?;
        serde_json::from_value(value).map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        tokio::time::timeout(self.timeout, self.transport.send(&frame))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout_ms()))?
    }

    /// Run the initialize handshake and discover capabilities.
    pub async fn handshake(&self, scope: &Scope) -> Result<Capabilities, HandshakeError> {
        debug!(server = %self.name, "Initializing MCP connection");

        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| HandshakeError::schema(methods::INITIALIZE, e.to_string()))?;
        let result: InitializeResult = self
            .request(methods::INITIALIZE, Some(params))
            .await
            .map_err(|e| e.into_handshake(methods::INITIALIZE))?;

        self.notify(methods::INITIALIZED, None).await?;

        info!(
            server = %self.name,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP connection initialized"
        );

        *self.server_capabilities.lock() = Some(result.capabilities);
        let mut capabilities = self.discover(scope).await?;
        capabilities.instructions = result.instructions;
        Ok(capabilities)
    }

    /// Re-list tools, resources and prompts without a new handshake.
    pub async fn discover(&self, scope: &Scope) -> Result<Capabilities, HandshakeError> {
        let advertised = self.server_capabilities.lock().clone().unwrap_or_default();

        let tools = if advertised.tools.is_some() {
            self.list_all::<ListToolsResult>(methods::TOOLS_LIST).await?
        } else {
            Vec::new()
        };
        if let Some(bad) = tools.iter().find(|t| !t.input_schema.is_object()) {
            return Err(HandshakeError::schema(
                methods::TOOLS_LIST,
                format!("tool '{}' has a non-object inputSchema", bad.name),
            ));
        }

        let mut resources = Vec::new();
        if advertised.resources.is_some() {
            for resource in self.list_all::<ListResourcesResult>(methods::RESOURCES_LIST).await? {
                resources.push(ResourceInfo {
                    uri: resource.uri,
                    name: resource.name,
                    description: resource.description,
                    mime_type: resource.mime_type,
                    template: false,
                });
            }
            match self
                .list_all::<ListResourceTemplatesResult>(methods::RESOURCE_TEMPLATES_LIST)
                .await
            {
                Ok(templates) => resources.extend(templates.into_iter().map(|t| ResourceInfo {
                    uri: t.uri_template,
                    name: t.name,
                    description: t.description,
                    mime_type: t.mime_type,
                    template: true,
                })),
                Err(HandshakeError::ServerError { code, .. }) if code == JsonRpcError::METHOD_NOT_FOUND => {}
                Err(e) => return Err(e),
            }
        }

        let prompts = if advertised.prompts.is_some() {
            self.list_all::<ListPromptsResult>(methods::PROMPTS_LIST).await?
        } else {
            Vec::new()
        };

        debug!(
            server = %self.name,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "Discovered capabilities"
        );

        Ok(Capabilities {
            server_name: self.name.clone(),
            scope: scope.clone(),
            tools,
            resources,
            prompts,
            instructions: None,
        })
    }

    async fn list_all<P>(&self, method: &str) -> Result<Vec<P::Item>, HandshakeError>
    where
        P: Page + DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: P = self
                .request(method, params)
                .await
                .map_err(|e| e.into_handshake(method))?;
            let (mut page_items, next) = page.into_parts();
            items.append(&mut page_items);

            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        warn!(server = %self.name, method = method, pages = MAX_LIST_PAGES, "Pagination truncated");
        Ok(items)
    }

    /// Call a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, InvocationError> {
        debug!(server = %self.name, tool = name, "Calling tool");

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(|e| InvocationError::Malformed(e.to_string()))?;

        let result: CallToolResult = self.request(methods::TOOLS_CALL, Some(params)).await?;
        if result.is_error {
            warn!(server = %self.name, tool = name, "Tool returned error");
        }
        Ok(result)
    }

    /// Read a resource.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, InvocationError> {
        let params = serde_json::to_value(ReadResourceParams { uri: uri.to_string() })
            .map_err(|e| InvocationError::Malformed(e.to_string()))?;
        Ok(self.request(methods::RESOURCES_READ, Some(params)).await?)
    }

    /// Render a prompt.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, InvocationError> {
        let params = serde_json::to_value(GetPromptParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(|e| InvocationError::Malformed(e.to_string()))?;
        Ok(self.request(methods::PROMPTS_GET, Some(params)).await?)
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<(), InvocationError> {
        let _: Value = self.request(methods::PING, None).await?;
        Ok(())
    }

    /// Close the connection. In-flight requests fail with a closed error.
    pub async fn close(&self) {
        if self.lost.is_cancelled() && !self.transport.is_connected() {
            return;
        }
        debug!(server = %self.name, "Closing MCP connection");

        self.loss.lock().get_or_insert(TransportError::Closed);
        self.lost.cancel();
        self.pending.lock().clear();
        self.transport.close().await;

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
    loss: Arc<Mutex<Option<TransportError>>>,
    lost: CancellationToken,
    notices: Option<mpsc::UnboundedSender<String>>,
) {
    loop {
        let frame = match transport.receive().await {
            Ok(frame) => frame,
            Err(reason) => {
                debug!(server = %name, reason = %reason, "Transport ended");
                loss.lock().get_or_insert(reason);
                lost.cancel();
                pending.lock().clear();
                return;
            }
        };

        let inbound = match Inbound::parse(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(server = %name, error = %e, "Ignoring malformed frame");
                continue;
            }
        };

        match inbound {
            Inbound::Response { id, outcome } => match pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(server = %name, id = ?id, "Response for unknown request"),
            },
            Inbound::Notification { method, .. } => match method.as_str() {
                methods::TOOLS_LIST_CHANGED | methods::RESOURCES_LIST_CHANGED | methods::PROMPTS_LIST_CHANGED => {
                    debug!(server = %name, method = %method, "Capabilities changed");
                    if let Some(notices) = &notices {
                        let _ = notices.send(method);
                    }
                }
                _ => debug!(server = %name, method = %method, "Ignoring notification"),
            },
            Inbound::Request { id, method, .. } => {
                let reply = if method == methods::PING {
                    JsonRpcResponse::success(id, json!({}))
                } else {
                    debug!(server = %name, method = %method, "Rejecting server request");
                    JsonRpcResponse::failure(
                        id,
                        JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, format!("method not supported: {}", method)),
                    )
                };
                match serde_json::to_string(&reply) {
                    Ok(frame) => {
                        if let Err(e) = transport.send(&frame).await {
                            debug!(server = %name, error = %e, "Failed to answer server request");
                        }
                    }
                    Err(e) => debug!(server = %name, error = %e, "Failed to encode reply"),
                }
            }
        }
    }
}
