//! Integration tests for the hub through its public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcphub_core::{
    AuthConfig, Config, ErrorKind, EventKind, Scope, ServerDescriptor, ServerId, ServerStatus, ToolArguments,
};
use mcphub_mcp::{DefaultTransportFactory, Hub, Transport, TransportError, TransportFactory};
use mcphub_store::{MemoryServerStore, ServerStore};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Wraps the real factory and counts opens.
struct CountingFactory {
    inner: DefaultTransportFactory,
    opens: AtomicUsize,
}

#[async_trait]
impl TransportFactory for CountingFactory {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(descriptor).await
    }
}

/// Minimal in-process MCP server offering a single `add` tool.
struct FakeServer {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
    tool_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let frame: Value = serde_json::from_str(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let (Some(method), Some(id)) = (frame["method"].as_str(), frame.get("id")) else {
            return Ok(());
        };
        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "fake" }
            }),
            "tools/list" => json!({
                "tools": [{
                    "name": "add",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                        "required": ["a", "b"]
                    }
                }]
            }),
            "tools/call" => {
                self.tool_calls.fetch_add(1, Ordering::SeqCst);
                let args = &frame["params"]["arguments"];
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                json!({ "content": [{ "type": "text", "text": sum.to_string() }] })
            }
            _ => json!({}),
        };
        let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        self.tx.send(reply.to_string()).map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

struct FakeFactory {
    tool_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn open(&self, _descriptor: &ServerDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(FakeServer {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            tool_calls: Arc::clone(&self.tool_calls),
        }))
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.supervisor.retry_base_delay_ms = 20;
    config.supervisor.retry_max_delay_ms = 80;
    config
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A subprocess that exits at once is retried exactly `max_retries` times.
#[cfg(unix)]
#[tokio::test]
async fn test_crashing_server_gives_up_after_retries() {
    let factory = Arc::new(CountingFactory {
        inner: DefaultTransportFactory::new(Duration::from_millis(200)),
        opens: AtomicUsize::new(0),
    });
    let store = Arc::new(MemoryServerStore::new());
    let hub = Hub::start_with(&fast_config(), store, factory.clone()).await.unwrap();

    let descriptor = ServerDescriptor::stdio("weather", "sh")
        .with_args(vec!["-c".to_string(), "exit 1".to_string()])
        .with_max_retries(3)
        .with_timeout(Duration::from_secs(5));
    let descriptor = hub.supervisor.create(descriptor).await.unwrap();

    let status = hub.supervisor.connect(descriptor.id).await.unwrap();
    assert_eq!(status, ServerStatus::Error);

    let supervisor = Arc::clone(&hub.supervisor);
    let id = descriptor.id;
    wait_until(|| factory.opens.load(Ordering::SeqCst) >= 4 && !supervisor.retry_pending(id)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(factory.opens.load(Ordering::SeqCst), 4);
    let state = hub.supervisor.status(descriptor.id).unwrap();
    assert_eq!(state.status, ServerStatus::Error);
    assert!(state.last_error.is_some());

    // Manual reconnect spends a fresh budget.
    hub.supervisor.reconnect(descriptor.id).await.unwrap();
    wait_until(|| factory.opens.load(Ordering::SeqCst) >= 8 && !supervisor.retry_pending(id)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(factory.opens.load(Ordering::SeqCst), 8);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_protected_servers_survive_delete() {
    let store = Arc::new(MemoryServerStore::new());
    let hub = Hub::start(&Config::default(), store.clone()).await.unwrap();

    for name in ["memory", "dynamic-mcp-api"] {
        let id = hub.supervisor.find(&Scope::default(), name).unwrap();
        let err = hub.supervisor.delete(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protected);
        assert!(store.find_by_name(&Scope::default(), name).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_tool_call_end_to_end() {
    let tool_calls = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(FakeFactory {
        tool_calls: Arc::clone(&tool_calls),
    });
    let hub = Hub::start_with(&Config::default(), Arc::new(MemoryServerStore::new()), factory)
        .await
        .unwrap();
    let mut events = hub.notifier.subscribe(&Scope::default());

    let descriptor = hub
        .supervisor
        .create(ServerDescriptor::stdio("calc", "calc-mcp"))
        .await
        .unwrap();
    assert_eq!(hub.supervisor.connect(descriptor.id).await.unwrap(), ServerStatus::Connected);

    let tools = hub.router.list_available_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "add");
    assert_eq!(tools[0].server, "calc");

    let envelope = hub
        .router
        .invoke("add", ToolArguments::new().with("a", 2_i64).with("b", 3_i64))
        .await;
    assert!(envelope.success, "{:?}", envelope);
    assert_eq!(envelope.text(), "5");
    assert_eq!(envelope.server, Some(descriptor.id));

    // Unknown tools and bad arguments never reach the server.
    let unknown = hub.router.invoke("subtract", ToolArguments::new()).await;
    assert_eq!(unknown.error, Some(ErrorKind::UnknownTool));
    let invalid = hub.router.invoke("add", ToolArguments::new().with("a", "two")).await;
    assert_eq!(invalid.error, Some(ErrorKind::InvalidArguments));
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

    let mut connected = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if let EventKind::ServerStatusChanged {
            server_id,
            status: ServerStatus::Connected,
            ..
        } = event.kind
        {
            connected |= server_id == descriptor.id;
        }
    }
    assert!(connected);

    hub.shutdown().await;
    assert_eq!(
        hub.supervisor.status(descriptor.id).unwrap().status,
        ServerStatus::Disconnected
    );
}

#[tokio::test]
async fn test_oauth_without_token_is_rejected() {
    let hub = Hub::start(&fast_config(), Arc::new(MemoryServerStore::new())).await.unwrap();
    let descriptor = ServerDescriptor::streamable_http("crm", "http://127.0.0.1:9/mcp")
        .with_auth(AuthConfig::OAuth {
            client_id: "client".to_string(),
            client_secret: None,
            token_url: None,
            scopes: Vec::new(),
            access_token: None,
            refresh_token: None,
        })
        .with_max_retries(0);
    let descriptor = hub.supervisor.create(descriptor).await.unwrap();

    assert_eq!(hub.supervisor.connect(descriptor.id).await.unwrap(), ServerStatus::Error);
    let state = hub.supervisor.status(descriptor.id).unwrap();
    assert!(state.last_error.unwrap().contains("access token"));
    assert!(!hub.supervisor.retry_pending(descriptor.id));
}

#[tokio::test]
async fn test_unknown_server_operations() {
    let hub = Hub::start(&Config::default(), Arc::new(MemoryServerStore::new())).await.unwrap();
    let err = hub.supervisor.connect(ServerId::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(hub.supervisor.status(ServerId::new()).is_none());
}
