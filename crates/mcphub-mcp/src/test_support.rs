//! In-process MCP server doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcphub_core::ServerDescriptor;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::protocol::{methods, JsonRpcError, MCP_PROTOCOL_VERSION};
use crate::transport::{Inbox, InboxSender, Transport, TransportFactory};

/// Scripted server behavior.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedServer {
    tools: Vec<(String, Value)>,
    resources: Vec<(String, String)>,
    prompts: Vec<String>,
    page_size: Option<usize>,
    raw_replies: HashMap<String, Value>,
    stalled_tools: HashSet<String>,
    failing_tools: HashSet<String>,
}

impl ScriptedServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tool(mut self, name: &str, schema: Value) -> Self {
        self.tools.push((name.to_string(), schema));
        self
    }

    pub(crate) fn with_resource(mut self, uri: &str, name: &str) -> Self {
        self.resources.push((uri.to_string(), name.to_string()));
        self
    }

    pub(crate) fn with_prompt(mut self, name: &str) -> Self {
        self.prompts.push(name.to_string());
        self
    }

    pub(crate) fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Answer `method` with `result` verbatim.
    pub(crate) fn with_raw_reply(mut self, method: &str, result: Value) -> Self {
        self.raw_replies.insert(method.to_string(), result);
        self
    }

    /// Never answer calls to `name`.
    pub(crate) fn with_stalled_tool(mut self, name: &str) -> Self {
        self.stalled_tools.insert(name.to_string());
        self
    }

    /// Answer calls to `name` with `isError: true`.
    pub(crate) fn with_failing_tool(mut self, name: &str) -> Self {
        self.failing_tools.insert(name.to_string());
        self
    }

    fn capabilities(&self) -> Value {
        let mut caps = json!({ "tools": { "listChanged": true } });
        if !self.resources.is_empty() {
            caps["resources"] = json!({});
        }
        if !self.prompts.is_empty() {
            caps["prompts"] = json!({});
        }
        caps
    }

    fn page<T: Clone>(&self, items: &[T], params: &Value) -> (Vec<T>, Option<String>) {
        let start: usize = params["cursor"].as_str().and_then(|c| c.parse().ok()).unwrap_or(0);
        let size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        (items[start.min(end)..end].to_vec(), next)
    }

    /// Reply to a request; `None` means never answer.
    fn reply(&self, method: &str, params: &Value) -> Option<Result<Value, JsonRpcError>> {
        if let Some(raw) = self.raw_replies.get(method) {
            return Some(Ok(raw.clone()));
        }

        let result = match method {
            methods::INITIALIZE => json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": self.capabilities(),
                "serverInfo": { "name": "scripted", "version": "0.0.1" },
            }),
            methods::PING => json!({}),
            methods::TOOLS_LIST => {
                let (tools, next) = self.page(&self.tools, params);
                let tools: Vec<Value> = tools
                    .into_iter()
                    .map(|(name, schema)| json!({ "name": name, "description": format!("{} tool", name), "inputSchema": schema }))
                    .collect();
                json!({ "tools": tools, "nextCursor": next })
            }
            methods::RESOURCES_LIST => {
                let (resources, next) = self.page(&self.resources, params);
                let resources: Vec<Value> = resources
                    .into_iter()
                    .map(|(uri, name)| json!({ "uri": uri, "name": name }))
                    .collect();
                json!({ "resources": resources, "nextCursor": next })
            }
            methods::RESOURCE_TEMPLATES_LIST => json!({ "resourceTemplates": [] }),
            methods::PROMPTS_LIST => {
                let (prompts, next) = self.page(&self.prompts, params);
                let prompts: Vec<Value> = prompts.into_iter().map(|name| json!({ "name": name })).collect();
                json!({ "prompts": prompts, "nextCursor": next })
            }
            methods::TOOLS_CALL => {
                let name = params["name"].as_str().unwrap_or_default();
                if self.stalled_tools.contains(name) {
                    return None;
                }
                if !self.tools.iter().any(|(tool, _)| tool == name) {
                    return Some(Err(JsonRpcError::new(
                        JsonRpcError::INVALID_PARAMS,
                        format!("unknown tool: {}", name),
                    )));
                }
                if self.failing_tools.contains(name) {
                    json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true })
                } else {
                    let text = format!("echo: {}", params["arguments"]);
                    json!({ "content": [{ "type": "text", "text": text }] })
                }
            }
            methods::RESOURCES_READ => {
                let uri = params["uri"].as_str().unwrap_or_default();
                json!({ "contents": [{ "uri": uri, "text": format!("contents of {}", uri) }] })
            }
            methods::PROMPTS_GET => {
                let name = params["name"].as_str().unwrap_or_default();
                json!({ "messages": [{ "role": "user", "content": { "type": "text", "text": format!("prompt {}", name) } }] })
            }
            other => {
                return Some(Err(JsonRpcError::new(
                    JsonRpcError::METHOD_NOT_FOUND,
                    format!("method not found: {}", other),
                )))
            }
        };
        Some(Ok(result))
    }
}

/// Transport wired straight to a [`ScriptedServer`].
pub(crate) struct ScriptedTransport {
    server: Mutex<ScriptedServer>,
    inbox: Inbox,
    sender: InboxSender,
    cancel: CancellationToken,
    sent: Mutex<Vec<Value>>,
    sends: AtomicUsize,
    stalled: AtomicBool,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new(server: ScriptedServer) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (inbox, sender) = Inbox::new(cancel.clone());
        Arc::new(Self {
            server: Mutex::new(server),
            inbox,
            sender,
            cancel,
            sent: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Methods of every request and notification sent by the client.
    pub(crate) fn methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| frame["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Responses the client sent to server-initiated requests.
    pub(crate) fn replies(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|frame| frame.get("method").is_none())
            .cloned()
            .collect()
    }

    /// Number of `tools/call` requests received.
    pub(crate) fn tool_calls(&self) -> usize {
        self.methods().iter().filter(|m| *m == methods::TOOLS_CALL).count()
    }

    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn push_notification(&self, method: &str) {
        self.push_frame(json!({ "jsonrpc": "2.0", "method": method }));
    }

    pub(crate) fn push_frame(&self, frame: Value) {
        self.sender.deliver(frame.to_string());
    }

    pub(crate) fn set_tools(&self, tools: Vec<(&str, Value)>) {
        self.server.lock().tools = tools.into_iter().map(|(n, s)| (n.to_string(), s)).collect();
    }

    /// Simulate the server going away.
    pub(crate) fn sever(&self) {
        self.sender.finish(TransportError::Closed);
    }

    /// Stop answering anything.
    pub(crate) fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.sends.fetch_add(1, Ordering::SeqCst);

        let frame: Value =
            serde_json::from_str(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.sent.lock().push(frame.clone());

        let (Some(method), Some(id)) = (frame["method"].as_str(), frame.get("id")) else {
            return Ok(());
        };
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let reply = self.server.lock().reply(method, &frame["params"]);
        let reply = match reply {
            None => return Ok(()),
            Some(Ok(result)) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Some(Err(error)) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        self.sender.deliver(reply.to_string());
        Ok(())
    }

    async fn receive(&self) -> Result<String, TransportError> {
        self.inbox.next().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbox.has_ended()
    }
}

/// Factory handing out scripted transports keyed by server name.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    servers: Mutex<HashMap<String, ScriptedServer>>,
    failing: Mutex<HashSet<String>>,
    opened: Mutex<HashMap<String, Vec<Arc<ScriptedTransport>>>>,
    attempts: Mutex<HashMap<String, usize>>,
    open_delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn serve(&self, name: &str, server: ScriptedServer) {
        self.servers.lock().insert(name.to_string(), server);
    }

    /// Make every open for `name` fail.
    pub(crate) fn fail(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub(crate) fn heal(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    /// Hold every open for `name` for `delay` before it succeeds or fails.
    pub(crate) fn delay_open(&self, name: &str, delay: Duration) {
        self.open_delays.lock().insert(name.to_string(), delay);
    }

    pub(crate) fn attempts(&self, name: &str) -> usize {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    /// Most recently opened transport for `name`.
    pub(crate) fn latest(&self, name: &str) -> Option<Arc<ScriptedTransport>> {
        self.opened.lock().get(name).and_then(|all| all.last().cloned())
    }

    /// `tools/call` requests across every transport opened so far.
    pub(crate) fn total_tool_calls(&self) -> usize {
        self.opened
            .lock()
            .values()
            .flat_map(|all| all.iter().map(|t| t.tool_calls()))
            .sum()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        let name = descriptor.name.clone();
        *self.attempts.lock().entry(name.clone()).or_insert(0) += 1;

        let delay = self.open_delays.lock().get(&name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&name) {
            return Err(TransportError::SpawnFailed(format!("{} exited immediately", name)));
        }
        let server = self
            .servers
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| TransportError::SpawnFailed(format!("no scripted server named {}", name)))?;

        let transport = ScriptedTransport::new(server);
        self.opened.lock().entry(name).or_default().push(Arc::clone(&transport));
        Ok(transport)
    }
}
