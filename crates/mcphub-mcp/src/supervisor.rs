//! Connection supervisor.
//!
//! Owns the lifecycle of every configured server:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               |                  |
//!                             fail        health/transport failure
//!                               v                  v
//!                             Error <--------------+
//!                               |
//!                        backoff retry (bounded by max_retries)
//!
//! any --disable--> Disabled --enable--> Disconnected
//! ```
//!
//! Each server has a transition lock; at most one transition runs per
//! server at a time, while different servers proceed independently.
//! Connect requests that find a transition in flight are coalesced into it.
//! Capabilities are invalidated before a server leaves `Connected`, and
//! populated only after it has entered `Connected`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use mcphub_core::config::{ProtectedServersConfig, SupervisorConfig};
use mcphub_core::{
    Config, ConnectionState, DomainEvent, EventKind, Scope, ServerDescriptor, ServerId, ServerStatus,
};
use mcphub_store::ServerStore;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::McpConnection;
use crate::error::{ConfigError, HandshakeError, McpError};
use crate::notifier::EventPublisher;
use crate::registry::{Capabilities, CapabilityRegistry};
use crate::transport::TransportFactory;

/// A scheduled automatic retry. `stop` only cuts the backoff sleep short;
/// an attempt already under way runs to completion under the transition lock.
struct RetryTimer {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervisor-side record of one server.
struct ServerSlot {
    id: ServerId,
    descriptor: RwLock<ServerDescriptor>,
    state: RwLock<ConnectionState>,
    /// Held for the duration of a lifecycle transition.
    transition: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Arc<McpConnection>>>,
    /// Stops the health/notification watcher of the current connection.
    watch: Mutex<Option<CancellationToken>>,
    retry: Mutex<Option<RetryTimer>>,
    /// Bumped whenever pending retries must be forgotten.
    generation: AtomicU64,
}

impl ServerSlot {
    fn new(descriptor: ServerDescriptor) -> Self {
        let state = ConnectionState::for_descriptor(&descriptor);
        Self {
            id: descriptor.id,
            descriptor: RwLock::new(descriptor),
            state: RwLock::new(state),
            transition: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            watch: Mutex::new(None),
            retry: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn descriptor(&self) -> ServerDescriptor {
        self.descriptor.read().clone()
    }

    fn name(&self) -> String {
        self.descriptor.read().name.clone()
    }

    fn status(&self) -> ServerStatus {
        self.state.read().status
    }
}

/// Drives connect, retry and health-check cycles for every server.
pub struct Supervisor {
    me: Weak<Supervisor>,
    slots: DashMap<ServerId, Arc<ServerSlot>>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn ServerStore>,
    factory: Arc<dyn TransportFactory>,
    events: EventPublisher,
    settings: SupervisorConfig,
    protected: ProtectedServersConfig,
    seeds: Vec<ServerDescriptor>,
    default_scope: Scope,
    /// Serializes name-uniqueness checks with the inserts they guard.
    config_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor. Nothing is loaded until [`initialize`](Self::initialize).
    pub fn new(
        config: &Config,
        store: Arc<dyn ServerStore>,
        factory: Arc<dyn TransportFactory>,
        events: EventPublisher,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            slots: DashMap::new(),
            registry: Arc::new(CapabilityRegistry::new(events.clone())),
            store,
            factory,
            events,
            settings: config.supervisor.clone(),
            protected: config.protected.clone(),
            seeds: config.servers.clone(),
            default_scope: config.general.default_scope(),
            config_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The capability registry fed by this supervisor.
    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Load stored servers, import seeds, make sure the protected servers
    /// exist, and start connecting every enabled auto-connect server.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let config_guard = self.config_lock.lock().await;

        for descriptor in self.store.list_all().await.map_err(ConfigError::from)? {
            self.insert_slot(descriptor);
        }

        for seed in &self.seeds {
            if self.name_taken(&seed.scope, &seed.name, None) {
                continue;
            }
            if seed.is_protected() {
                warn!(server = %seed.name, "Ignoring seed that uses a reserved name");
                continue;
            }
            self.insert_new(seed.clone()).await?;
        }

        let mut scopes: BTreeSet<Scope> = self.slots.iter().map(|s| s.descriptor.read().scope.clone()).collect();
        scopes.insert(self.default_scope.clone());
        for scope in &scopes {
            self.ensure_protected(scope).await?;
        }
        drop(config_guard);

        let auto: Vec<ServerId> = self
            .slots
            .iter()
            .filter(|s| {
                let d = s.descriptor.read();
                d.enabled && d.auto_connect
            })
            .map(|s| s.id)
            .collect();

        info!(servers = self.slots.len(), auto_connect = auto.len(), "Supervisor initialized");

        for id in auto {
            if let Some(me) = self.me.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = me.connect(id).await {
                        warn!(server = %id, error = %e, "Auto-connect failed");
                    }
                });
            }
        }

        Ok(())
    }

    /// Register a new server.
    pub async fn create(&self, descriptor: ServerDescriptor) -> Result<ServerDescriptor, McpError> {
        validate(&descriptor)?;
        if descriptor.is_protected() {
            return Err(ConfigError::Reserved(descriptor.name).into());
        }

        let config_guard = self.config_lock.lock().await;
        if self.slots.contains_key(&descriptor.id) || self.name_taken(&descriptor.scope, &descriptor.name, None) {
            return Err(ConfigError::DuplicateName {
                scope: descriptor.scope.to_string(),
                name: descriptor.name.clone(),
            }
            .into());
        }
        self.insert_new(descriptor.clone()).await?;
        self.ensure_protected(&descriptor.scope).await?;
        drop(config_guard);

        if descriptor.enabled && descriptor.auto_connect {
            if let Err(e) = self.connect(descriptor.id).await {
                warn!(server = %descriptor.name, error = %e, "Auto-connect failed");
            }
        }
        Ok(descriptor)
    }

    /// Replace a server's settings. Id, scope, enablement and creation time
    /// are kept; a live connection is re-established with the new settings.
    pub async fn update(&self, id: ServerId, changes: ServerDescriptor) -> Result<ServerDescriptor, McpError> {
        let slot = self.slot(id)?;
        let current = slot.descriptor();

        if current.is_protected() && changes.name != current.name {
            return Err(ConfigError::Protected(current.name).into());
        }
        if !current.is_protected() && changes.is_protected() {
            return Err(ConfigError::Reserved(changes.name).into());
        }

        let updated = ServerDescriptor {
            id,
            scope: current.scope.clone(),
            enabled: current.enabled,
            created_at: current.created_at,
            updated_at: Utc::now(),
            ..changes
        };
        validate(&updated)?;

        let config_guard = self.config_lock.lock().await;
        if self.name_taken(&updated.scope, &updated.name, Some(id)) {
            return Err(ConfigError::DuplicateName {
                scope: updated.scope.to_string(),
                name: updated.name.clone(),
            }
            .into());
        }

        let _transition = slot.transition.lock().await;
        self.store.update(&updated).await.map_err(ConfigError::from)?;
        *slot.descriptor.write() = updated.clone();
        drop(config_guard);

        self.events.publish(DomainEvent::new(
            updated.scope.clone(),
            EventKind::ServerUpdated {
                server_id: id,
                server_name: updated.name.clone(),
            },
        ));
        info!(server = %updated.name, "Server updated");

        if matches!(slot.status(), ServerStatus::Connected | ServerStatus::Connecting) {
            self.cancel_retry(&slot);
            self.teardown(&slot).await;
            slot.state.write().retry_count = 0;
            self.establish(&slot).await;
        }

        Ok(updated)
    }

    /// Remove a server. Protected servers cannot be removed.
    pub async fn delete(&self, id: ServerId) -> Result<(), McpError> {
        let slot = self.slot(id)?;
        let descriptor = slot.descriptor();
        if descriptor.is_protected() {
            return Err(ConfigError::Protected(descriptor.name).into());
        }

        self.cancel_retry(&slot);
        let _transition = slot.transition.lock().await;
        self.store.delete(id).await.map_err(ConfigError::from)?;
        self.teardown(&slot).await;
        self.slots.remove(&id);

        info!(server = %descriptor.name, "Server deleted");
        self.events.publish(DomainEvent::new(
            descriptor.scope,
            EventKind::ServerDeleted {
                server_id: id,
                server_name: descriptor.name,
            },
        ));
        Ok(())
    }

    /// Connect a server. Returns the status after the attempt, or the
    /// current status if another transition was already in flight.
    pub async fn connect(&self, id: ServerId) -> Result<ServerStatus, McpError> {
        let slot = self.slot(id)?;
        if !slot.descriptor.read().enabled {
            return Err(ConfigError::Disabled(slot.name()).into());
        }

        let Ok(_transition) = slot.transition.try_lock() else {
            debug!(server = %slot.name(), "Transition in flight; connect coalesced");
            return Ok(slot.status());
        };

        if slot.status() == ServerStatus::Connected && self.live(&slot).is_some() {
            return Ok(ServerStatus::Connected);
        }

        self.cancel_retry(&slot);
        slot.state.write().retry_count = 0;
        Ok(self.establish(&slot).await)
    }

    /// Tear down any connection and connect again with a fresh retry budget.
    pub async fn reconnect(&self, id: ServerId) -> Result<ServerStatus, McpError> {
        let slot = self.slot(id)?;
        if !slot.descriptor.read().enabled {
            return Err(ConfigError::Disabled(slot.name()).into());
        }

        let Ok(_transition) = slot.transition.try_lock() else {
            debug!(server = %slot.name(), "Transition in flight; reconnect coalesced");
            return Ok(slot.status());
        };

        info!(server = %slot.name(), "Manual reconnect");
        self.cancel_retry(&slot);
        self.teardown(&slot).await;
        slot.state.write().retry_count = 0;
        Ok(self.establish(&slot).await)
    }

    /// Close a server's connection and stop retrying.
    pub async fn disconnect(&self, id: ServerId) -> Result<(), McpError> {
        let slot = self.slot(id)?;
        self.cancel_retry(&slot);
        let _transition = slot.transition.lock().await;

        self.teardown(&slot).await;
        slot.state.write().retry_count = 0;
        if slot.status() != ServerStatus::Disabled {
            self.set_status(&slot, ServerStatus::Disconnected, None);
        }
        Ok(())
    }

    /// Disable a server: close it and suppress retries until enabled.
    pub async fn disable(&self, id: ServerId) -> Result<(), McpError> {
        let slot = self.slot(id)?;
        self.cancel_retry(&slot);
        let _transition = slot.transition.lock().await;

        let mut descriptor = slot.descriptor();
        if descriptor.enabled {
            descriptor.enabled = false;
            descriptor.updated_at = Utc::now();
            self.store.update(&descriptor).await.map_err(ConfigError::from)?;
            *slot.descriptor.write() = descriptor.clone();
            self.publish_updated(&descriptor);
        }

        self.teardown(&slot).await;
        slot.state.write().retry_count = 0;
        self.set_status(&slot, ServerStatus::Disabled, None);
        Ok(())
    }

    /// Re-enable a server; auto-connect servers connect immediately.
    pub async fn enable(&self, id: ServerId) -> Result<ServerStatus, McpError> {
        let slot = self.slot(id)?;
        {
            let _transition = slot.transition.lock().await;
            let mut descriptor = slot.descriptor();
            if descriptor.enabled {
                return Ok(slot.status());
            }
            descriptor.enabled = true;
            descriptor.updated_at = Utc::now();
            self.store.update(&descriptor).await.map_err(ConfigError::from)?;
            *slot.descriptor.write() = descriptor.clone();
            self.publish_updated(&descriptor);
            self.set_status(&slot, ServerStatus::Disconnected, None);
        }

        if slot.descriptor.read().auto_connect {
            return self.connect(id).await;
        }
        Ok(slot.status())
    }

    /// Re-list a connected server's capabilities.
    pub async fn refresh_capabilities(&self, id: ServerId) -> Result<(), McpError> {
        let slot = self.slot(id)?;
        let _transition = slot.transition.lock().await;

        let Some(connection) = self.live(&slot) else {
            return Err(HandshakeError::Transport(crate::error::TransportError::Closed).into());
        };
        let scope = slot.descriptor.read().scope.clone();
        let capabilities = connection.discover(&scope).await?;

        if slot.status() != ServerStatus::Connected {
            return Ok(());
        }
        self.install_capabilities(&slot, capabilities);
        Ok(())
    }

    /// Stop every server and pending retry.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ServerSlot>> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        for slot in slots {
            self.cancel_retry(&slot);
            let _transition = slot.transition.lock().await;
            self.teardown(&slot).await;
            if !matches!(slot.status(), ServerStatus::Disabled | ServerStatus::Disconnected) {
                self.set_status(&slot, ServerStatus::Disconnected, None);
            }
        }
        info!("Supervisor shut down");
    }

    /// Live state of a server.
    pub fn status(&self, id: ServerId) -> Option<ConnectionState> {
        self.slots.get(&id).map(|s| s.state.read().clone())
    }

    /// Descriptor and state of every server, optionally in one scope,
    /// ordered by scope and name.
    pub fn statuses(&self, scope: Option<&Scope>) -> Vec<(ServerDescriptor, ConnectionState)> {
        let mut all: Vec<(ServerDescriptor, ConnectionState)> = self
            .slots
            .iter()
            .map(|s| (s.descriptor(), s.state.read().clone()))
            .filter(|(d, _)| scope.map_or(true, |scope| &d.scope == scope))
            .collect();
        all.sort_by(|(a, _), (b, _)| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));
        all
    }

    /// Descriptor of a server.
    pub fn descriptor(&self, id: ServerId) -> Option<ServerDescriptor> {
        self.slots.get(&id).map(|s| s.descriptor())
    }

    /// Find a server by name within a scope.
    pub fn find(&self, scope: &Scope, name: &str) -> Option<ServerId> {
        self.slots
            .iter()
            .find(|s| {
                let d = s.descriptor.read();
                &d.scope == scope && d.name == name
            })
            .map(|s| s.id)
    }

    /// The connection of a server that is `Connected`.
    pub fn live_connection(&self, id: ServerId) -> Option<Arc<McpConnection>> {
        let slot = self.slots.get(&id).map(|s| Arc::clone(s.value()))?;
        if slot.status() != ServerStatus::Connected {
            return None;
        }
        self.live(&slot)
    }

    /// Whether an automatic retry is scheduled.
    pub fn retry_pending(&self, id: ServerId) -> bool {
        self.slots
            .get(&id)
            .map(|s| s.retry.lock().as_ref().map_or(false, |t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Transitions. Callers hold the slot's transition lock.
    // ------------------------------------------------------------------

    /// One connection attempt. On failure the server moves to `Error` and a
    /// retry is scheduled if budget remains.
    async fn establish(&self, slot: &Arc<ServerSlot>) -> ServerStatus {
        let generation = slot.generation.load(Ordering::SeqCst);
        let descriptor = slot.descriptor();
        self.set_status(slot, ServerStatus::Connecting, None);
        info!(
            server = %descriptor.name,
            transport = %descriptor.transport.kind(),
            target = %descriptor.transport.target(),
            "Connecting to MCP server"
        );

        match self.open_session(&descriptor).await {
            Ok((connection, capabilities, notices)) => {
                *slot.connection.lock() = Some(Arc::clone(&connection));
                {
                    let mut state = slot.state.write();
                    state.last_connected = Some(Utc::now());
                    state.last_error = None;
                    state.retry_count = 0;
                }
                self.set_status(slot, ServerStatus::Connected, None);
                self.install_capabilities(slot, capabilities);

                let token = CancellationToken::new();
                *slot.watch.lock() = Some(token.clone());
                if let Some(me) = self.me.upgrade() {
                    tokio::spawn(Self::watch(me, slot.id, connection, notices, token));
                }
                ServerStatus::Connected
            }
            Err(e) => {
                warn!(
                    server = %descriptor.name,
                    kind = %e.kind(),
                    error = %e,
                    "Connection attempt failed"
                );
                self.set_status(slot, ServerStatus::Error, Some(e.to_string()));
                self.schedule_retry(slot, generation);
                ServerStatus::Error
            }
        }
    }

    async fn open_session(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<(Arc<McpConnection>, Capabilities, mpsc::UnboundedReceiver<String>), HandshakeError> {
        let timeout = descriptor.settings.connection_timeout();
        let timeout_ms = descriptor.settings.connection_timeout_ms;

        let transport = tokio::time::timeout(timeout, self.factory.open(descriptor))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout_ms))??;

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = McpConnection::start(descriptor.name.clone(), transport, timeout, Some(tx));

        match tokio::time::timeout(timeout, connection.handshake(&descriptor.scope)).await {
            Ok(Ok(capabilities)) => Ok((connection, capabilities, rx)),
            Ok(Err(e)) => {
                connection.close().await;
                Err(e)
            }
            Err(_) => {
                connection.close().await;
                Err(HandshakeError::Timeout(timeout_ms))
            }
        }
    }

    fn install_capabilities(&self, slot: &ServerSlot, capabilities: Capabilities) {
        let descriptor = slot.descriptor();
        let (tools, resources, prompts) = (
            capabilities.tools.len(),
            capabilities.resources.len(),
            capabilities.prompts.len(),
        );
        self.registry.refresh(slot.id, capabilities);

        debug!(server = %descriptor.name, tools, resources, prompts, "Capabilities cached");
        self.events.publish(DomainEvent::new(
            descriptor.scope,
            EventKind::CapabilitiesRefreshed {
                server_id: slot.id,
                server_name: descriptor.name,
                tools,
                resources,
                prompts,
            },
        ));
    }

    /// Drop the live connection, invalidating capabilities first.
    async fn teardown(&self, slot: &ServerSlot) {
        if let Some(token) = slot.watch.lock().take() {
            token.cancel();
        }
        self.registry.invalidate(slot.id);
        let connection = slot.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Forget pending retries. A retry already past its backoff finishes its
    /// attempt; the caller tears it down once it holds the transition lock.
    fn cancel_retry(&self, slot: &ServerSlot) {
        slot.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = slot.retry.lock().take() {
            timer.stop.cancel();
        }
    }

    /// Schedule the next retry, unless the budget is spent or retries were
    /// cancelled since `generation` was read.
    fn schedule_retry(&self, slot: &ServerSlot, generation: u64) {
        if slot.generation.load(Ordering::SeqCst) != generation {
            debug!(server = %slot.name(), "Retries cancelled during attempt");
            return;
        }
        let max_retries = slot.descriptor.read().settings.max_retries;
        let attempt = {
            let mut state = slot.state.write();
            if state.retry_count >= max_retries {
                None
            } else {
                state.retry_count += 1;
                Some(state.retry_count)
            }
        };

        let Some(attempt) = attempt else {
            error!(
                server = %slot.name(),
                retries = max_retries,
                "Retries exhausted; waiting for a manual reconnect"
            );
            return;
        };

        let delay = self.settings.backoff_delay(attempt);
        debug!(server = %slot.name(), attempt, delay_ms = delay.as_millis() as u64, "Scheduling retry");

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let id = slot.id;
        let stop = CancellationToken::new();
        let sleeping = stop.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = sleeping.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            Self::retry(me, id, generation).await;
        });
        *slot.retry.lock() = Some(RetryTimer { stop, handle });
    }

    fn retry(self: Arc<Self>, id: ServerId, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Ok(slot) = self.slot(id) else {
                return;
            };
            let _transition = slot.transition.lock().await;
            if slot.generation.load(Ordering::SeqCst) != generation || slot.status() != ServerStatus::Error {
                debug!(server = %slot.name(), "Stale retry skipped");
                return;
            }
            self.establish(&slot).await;
        })
    }

    /// Watch one connection: refresh on list changes, ping on an interval,
    /// and report the connection lost when it ends.
    fn watch(
        self: Arc<Self>,
        id: ServerId,
        connection: Arc<McpConnection>,
        mut notices: mpsc::UnboundedReceiver<String>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let interval = self.settings.health_check_interval().max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = connection.closed() => {
                        let reason = format!("connection lost: {}", connection.loss_reason());
                        self.connection_lost(id, &connection, reason).await;
                        return;
                    }
                    Some(method) = notices.recv() => {
                        debug!(server = %connection.name(), method = %method, "Refreshing capabilities");
                        if let Err(e) = self.refresh_capabilities(id).await {
                            warn!(server = %connection.name(), error = %e, "Capability refresh failed");
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = connection.ping().await {
                            if stop.is_cancelled() {
                                return;
                            }
                            let reason = format!("health check failed: {}", e);
                            self.connection_lost(id, &connection, reason).await;
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn connection_lost(&self, id: ServerId, connection: &Arc<McpConnection>, reason: String) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let _transition = slot.transition.lock().await;

        let current = slot.connection.lock().clone();
        match current {
            Some(current) if Arc::ptr_eq(&current, connection) => {}
            _ => return,
        }

        warn!(server = %slot.name(), reason = %reason, "MCP server unavailable");
        let generation = slot.generation.load(Ordering::SeqCst);
        self.teardown(&slot).await;
        slot.state.write().retry_count = 0;
        self.set_status(&slot, ServerStatus::Error, Some(reason));
        self.schedule_retry(&slot, generation);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn slot(&self, id: ServerId) -> Result<Arc<ServerSlot>, ConfigError> {
        self.slots
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    fn live(&self, slot: &ServerSlot) -> Option<Arc<McpConnection>> {
        slot.connection.lock().clone().filter(|c| c.is_alive())
    }

    fn set_status(&self, slot: &ServerSlot, status: ServerStatus, error: Option<String>) {
        {
            let mut state = slot.state.write();
            state.status = status;
            if error.is_some() {
                state.last_error = error.clone();
            }
        }

        let descriptor = slot.descriptor.read();
        info!(server = %descriptor.name, status = %status, "Server status changed");
        self.events.publish(DomainEvent::status_changed(
            descriptor.scope.clone(),
            slot.id,
            descriptor.name.clone(),
            status,
            error,
        ));
    }

    fn publish_updated(&self, descriptor: &ServerDescriptor) {
        self.events.publish(DomainEvent::new(
            descriptor.scope.clone(),
            EventKind::ServerUpdated {
                server_id: descriptor.id,
                server_name: descriptor.name.clone(),
            },
        ));
    }

    fn name_taken(&self, scope: &Scope, name: &str, except: Option<ServerId>) -> bool {
        self.slots.iter().any(|s| {
            let d = s.descriptor.read();
            Some(d.id) != except && &d.scope == scope && d.name == name
        })
    }

    fn insert_slot(&self, descriptor: ServerDescriptor) {
        self.slots
            .entry(descriptor.id)
            .or_insert_with(|| Arc::new(ServerSlot::new(descriptor)));
    }

    async fn insert_new(&self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        self.store.insert(&descriptor).await.map_err(ConfigError::from)?;
        info!(server = %descriptor.name, scope = %descriptor.scope, "Server created");
        self.events.publish(DomainEvent::new(
            descriptor.scope.clone(),
            EventKind::ServerCreated {
                server_id: descriptor.id,
                server_name: descriptor.name.clone(),
            },
        ));
        self.insert_slot(descriptor);
        Ok(())
    }

    /// Create the protected servers of a scope if missing. Caller holds the
    /// config lock.
    async fn ensure_protected(&self, scope: &Scope) -> Result<(), McpError> {
        for descriptor in self.protected.descriptors(scope) {
            if self.name_taken(scope, &descriptor.name, None) {
                continue;
            }
            let mut descriptor = descriptor;
            descriptor.settings.connection_timeout_ms = self.settings.connection_timeout_ms;
            descriptor.settings.max_retries = self.settings.max_retries;
            self.insert_new(descriptor).await?;
        }
        Ok(())
    }
}

fn validate(descriptor: &ServerDescriptor) -> Result<(), ConfigError> {
    let result = descriptor.validate();
    if result.is_ok() {
        return Ok(());
    }
    let problems: Vec<String> = result
        .errors()
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect();
    Err(ConfigError::Invalid(problems.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EventNotifier;
    use crate::test_support::{ScriptedFactory, ScriptedServer};
    use mcphub_core::{ErrorKind, EventKind};
    use mcphub_store::MemoryServerStore;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.supervisor.retry_base_delay_ms = 10;
        config.supervisor.retry_max_delay_ms = 40;
        config.supervisor.health_check_interval_secs = 3_600;
        config
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        factory: Arc<ScriptedFactory>,
        store: Arc<MemoryServerStore>,
        events: broadcast::Receiver<DomainEvent>,
        _notifier: EventNotifier,
    }

    fn harness(config: Config) -> Harness {
        let (notifier, publisher) = EventNotifier::start(256);
        let events = notifier.subscribe_all();
        let factory = ScriptedFactory::new();
        let store = Arc::new(MemoryServerStore::new());
        let supervisor = Supervisor::new(
            &config,
            store.clone() as Arc<dyn ServerStore>,
            factory.clone() as Arc<dyn TransportFactory>,
            publisher,
        );
        Harness {
            supervisor,
            factory,
            store,
            events,
            _notifier: notifier,
        }
    }

    async fn wait_for(supervisor: &Supervisor, id: ServerId, status: ServerStatus) {
        for _ in 0..200 {
            if supervisor.status(id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never reached {:?}: {:?}", status, supervisor.status(id));
    }

    fn weather() -> ServerDescriptor {
        ServerDescriptor::stdio("weather", "weather-mcp").with_max_retries(3)
    }

    fn weather_server() -> ScriptedServer {
        ScriptedServer::new().with_tool("get_forecast", json!({"type": "object"}))
    }

    #[tokio::test]
    async fn test_initialize_creates_protected_servers() {
        let h = harness(test_config());
        h.supervisor.initialize().await.unwrap();

        let scope = Scope::default();
        let memory = h.supervisor.find(&scope, "memory").unwrap();
        let dynamic = h.supervisor.find(&scope, "dynamic-mcp-api").unwrap();
        assert_eq!(h.store.len(), 2);

        // Protected servers do not connect unless configured to.
        assert_eq!(h.supervisor.status(memory).unwrap().status, ServerStatus::Disconnected);
        assert_eq!(h.supervisor.status(dynamic).unwrap().status, ServerStatus::Disconnected);

        // A second initialize does not duplicate them.
        h.supervisor.initialize().await.unwrap();
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_protected_servers_cannot_be_deleted_or_renamed() {
        let h = harness(test_config());
        h.supervisor.initialize().await.unwrap();
        let memory = h.supervisor.find(&Scope::default(), "memory").unwrap();

        let err = h.supervisor.delete(memory).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protected);

        let mut renamed = h.supervisor.descriptor(memory).unwrap();
        renamed.name = "forgetful".to_string();
        let err = h.supervisor.update(memory, renamed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protected);

        // Disabling is allowed.
        h.supervisor.disable(memory).await.unwrap();
        assert_eq!(h.supervisor.status(memory).unwrap().status, ServerStatus::Disabled);
        assert!(h.supervisor.find(&Scope::default(), "memory").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_in_scope_is_rejected() {
        let h = harness(test_config());
        h.supervisor.create(weather()).await.unwrap();

        let err = h.supervisor.create(weather()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);

        // Same name in another scope is fine.
        h.supervisor.create(weather().with_scope("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_names_cannot_be_taken() {
        let h = harness(test_config());
        let team = Scope::new("team");

        let err = h
            .supervisor
            .create(ServerDescriptor::stdio("memory", "my-memory").with_scope("team"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protected);
        assert!(h.supervisor.find(&team, "memory").is_none());
        assert!(h.store.list(&team).await.unwrap().is_empty());

        let descriptor = h.supervisor.create(weather()).await.unwrap();
        let mut renamed = descriptor.clone();
        renamed.name = "dynamic-mcp-api".to_string();
        let err = h.supervisor.update(descriptor.id, renamed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protected);
        assert_eq!(h.supervisor.descriptor(descriptor.id).unwrap().name, "weather");
    }

    #[tokio::test]
    async fn test_connect_populates_registry() {
        let mut h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();

        let status = h.supervisor.connect(descriptor.id).await.unwrap();
        assert_eq!(status, ServerStatus::Connected);
        assert_eq!(h.supervisor.registry().find_tool_owner("get_forecast"), Some(descriptor.id));
        assert!(h.supervisor.live_connection(descriptor.id).is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut statuses = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let EventKind::ServerStatusChanged { status, server_id, .. } = event.kind {
                if server_id == descriptor.id {
                    statuses.push(status);
                }
            }
        }
        assert_eq!(statuses, vec![ServerStatus::Connecting, ServerStatus::Connected]);
    }

    #[tokio::test]
    async fn test_auto_connect_on_initialize() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        h.store.insert(&weather().with_auto_connect(true)).await.unwrap();

        h.supervisor.initialize().await.unwrap();
        let id = h.supervisor.find(&Scope::default(), "weather").unwrap();
        wait_for(&h.supervisor, id, ServerStatus::Connected).await;
        assert!(h.supervisor.registry().get(id).is_some());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let h = harness(test_config());
        h.factory.fail("weather");
        let descriptor = h.supervisor.create(weather()).await.unwrap();

        let status = h.supervisor.connect(descriptor.id).await.unwrap();
        assert_eq!(status, ServerStatus::Error);

        // One attempt plus three retries, then nothing more.
        for _ in 0..200 {
            if h.factory.attempts("weather") >= 4 && !h.supervisor.retry_pending(descriptor.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.factory.attempts("weather"), 4);
        let state = h.supervisor.status(descriptor.id).unwrap();
        assert_eq!(state.status, ServerStatus::Error);
        assert_eq!(state.retry_count, 3);
        assert!(state.last_error.is_some());

        // A manual reconnect gets a fresh budget.
        h.factory.heal("weather");
        h.factory.serve("weather", weather_server());
        let status = h.supervisor.reconnect(descriptor.id).await.unwrap();
        assert_eq!(status, ServerStatus::Connected);
        assert_eq!(h.supervisor.status(descriptor.id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_when_server_returns() {
        let h = harness(test_config());
        h.factory.fail("weather");
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        h.factory.heal("weather");
        h.factory.serve("weather", weather_server());
        wait_for(&h.supervisor, descriptor.id, ServerStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_lost_connection_invalidates_and_retries() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();
        let registry = h.supervisor.registry();
        assert!(registry.find_tool_owner("get_forecast").is_some());

        h.factory.fail("weather");
        h.factory.latest("weather").unwrap().sever();
        wait_for(&h.supervisor, descriptor.id, ServerStatus::Error).await;
        assert_eq!(registry.find_tool_owner("get_forecast"), None);
        assert!(h.supervisor.live_connection(descriptor.id).is_none());

        h.factory.heal("weather");
        h.factory.serve("weather", weather_server());
        wait_for(&h.supervisor, descriptor.id, ServerStatus::Connected).await;
        assert_eq!(registry.find_tool_owner("get_forecast"), Some(descriptor.id));
    }

    #[tokio::test]
    async fn test_failed_health_check_moves_to_error() {
        let mut config = test_config();
        config.supervisor.health_check_interval_secs = 1;
        let h = harness(config);
        h.factory.serve("weather", weather_server());
        let descriptor = h
            .supervisor
            .create(weather().with_timeout(Duration::from_millis(200)))
            .await
            .unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        h.factory.fail("weather");
        h.factory.latest("weather").unwrap().stall();
        for _ in 0..300 {
            if h.supervisor.status(descriptor.id).map(|s| s.status) != Some(ServerStatus::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(h.supervisor.status(descriptor.id).unwrap().status, ServerStatus::Connected);
        assert_eq!(h.supervisor.registry().find_tool_owner("get_forecast"), None);
    }

    #[tokio::test]
    async fn test_disable_suppresses_retries() {
        let h = harness(test_config());
        h.factory.fail("weather");
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        h.supervisor.disable(descriptor.id).await.unwrap();
        let attempts = h.factory.attempts("weather");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.factory.attempts("weather"), attempts);
        assert_eq!(h.supervisor.status(descriptor.id).unwrap().status, ServerStatus::Disabled);
        assert!(!h.store.get_sync(descriptor.id).unwrap().enabled);

        let err = h.supervisor.connect(descriptor.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disabled);

        h.factory.heal("weather");
        h.factory.serve("weather", weather_server());
        assert_eq!(h.supervisor.enable(descriptor.id).await.unwrap(), ServerStatus::Disconnected);
        assert_eq!(h.supervisor.connect(descriptor.id).await.unwrap(), ServerStatus::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_capabilities() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        h.supervisor.disconnect(descriptor.id).await.unwrap();
        assert_eq!(h.supervisor.registry().find_tool_owner("get_forecast"), None);
        assert_eq!(
            h.supervisor.status(descriptor.id).unwrap().status,
            ServerStatus::Disconnected
        );
        assert!(h.factory.latest("weather").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_coalesced() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();

        let (a, b) = tokio::join!(
            h.supervisor.connect(descriptor.id),
            h.supervisor.connect(descriptor.id)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.factory.attempts("weather"), 1);
        wait_for(&h.supervisor, descriptor.id, ServerStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_list_changed_refreshes_registry() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        let transport = h.factory.latest("weather").unwrap();
        transport.set_tools(vec![("get_alerts", json!({"type": "object"}))]);
        transport.push_notification(crate::protocol::methods::TOOLS_LIST_CHANGED);

        let registry = h.supervisor.registry();
        for _ in 0..100 {
            if registry.find_tool_owner("get_alerts").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.find_tool_owner("get_alerts"), Some(descriptor.id));
        assert_eq!(registry.find_tool_owner("get_forecast"), None);
    }

    #[tokio::test]
    async fn test_update_reconnects_with_new_settings() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        h.factory.serve("weather-v2", ScriptedServer::new().with_tool("get_radar", json!({"type": "object"})));
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        let mut changes = descriptor.clone();
        changes.name = "weather-v2".to_string();
        let updated = h.supervisor.update(descriptor.id, changes).await.unwrap();
        assert_eq!(updated.id, descriptor.id);
        assert_eq!(h.supervisor.status(descriptor.id).unwrap().status, ServerStatus::Connected);
        assert_eq!(h.supervisor.registry().find_tool_owner("get_radar"), Some(descriptor.id));
        assert_eq!(h.store.get_sync(descriptor.id).unwrap().name, "weather-v2");
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let mut h = harness(test_config());
        h.factory.serve("weather", weather_server());
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        h.supervisor.connect(descriptor.id).await.unwrap();

        h.supervisor.delete(descriptor.id).await.unwrap();
        assert!(h.supervisor.status(descriptor.id).is_none());
        assert!(h.supervisor.registry().get(descriptor.id).is_none());
        assert!(h.store.get_sync(descriptor.id).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut deleted = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event.kind, EventKind::ServerDeleted { server_id, .. } if server_id == descriptor.id) {
                deleted = true;
            }
        }
        assert!(deleted);

        let err = h.supervisor.connect(descriptor.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_retry_in_flight() {
        let h = harness(test_config());
        h.factory.serve("weather", weather_server());
        h.factory.fail("weather");
        let descriptor = h.supervisor.create(weather()).await.unwrap();
        assert_eq!(h.supervisor.connect(descriptor.id).await.unwrap(), ServerStatus::Error);

        h.factory.heal("weather");
        h.factory.delay_open("weather", Duration::from_millis(200));
        // The first retry fires after 10ms and is then stuck opening.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.factory.attempts("weather"), 2);

        h.supervisor.disconnect(descriptor.id).await.unwrap();
        let transport = h.factory.latest("weather").unwrap();
        assert!(transport.is_closed());
        assert_eq!(h.supervisor.status(descriptor.id).unwrap().status, ServerStatus::Disconnected);
        assert!(h.supervisor.registry().get(descriptor.id).is_none());
        assert!(!h.supervisor.retry_pending(descriptor.id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.factory.attempts("weather"), 2);
    }

    #[tokio::test]
    async fn test_failed_attempt_after_disable_schedules_nothing() {
        let h = harness(test_config());
        h.factory.fail("weather");
        h.factory.delay_open("weather", Duration::from_millis(150));
        let descriptor = h.supervisor.create(weather()).await.unwrap();

        let supervisor = Arc::clone(&h.supervisor);
        let id = descriptor.id;
        let connecting = tokio::spawn(async move { supervisor.connect(id).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.supervisor.disable(descriptor.id).await.unwrap();
        assert!(connecting.await.unwrap().is_ok());
        assert_eq!(h.supervisor.status(descriptor.id).unwrap().status, ServerStatus::Disabled);
        assert!(!h.supervisor.retry_pending(descriptor.id));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.factory.attempts("weather"), 1);
    }

    /// Store whose deletes always fail.
    struct UndeletableStore(MemoryServerStore);

    #[async_trait::async_trait]
    impl ServerStore for UndeletableStore {
        async fn list(&self, scope: &Scope) -> mcphub_store::Result<Vec<ServerDescriptor>> {
            self.0.list(scope).await
        }
        async fn list_all(&self) -> mcphub_store::Result<Vec<ServerDescriptor>> {
            self.0.list_all().await
        }
        async fn get(&self, id: ServerId) -> mcphub_store::Result<Option<ServerDescriptor>> {
            self.0.get(id).await
        }
        async fn find_by_name(&self, scope: &Scope, name: &str) -> mcphub_store::Result<Option<ServerDescriptor>> {
            self.0.find_by_name(scope, name).await
        }
        async fn insert(&self, descriptor: &ServerDescriptor) -> mcphub_store::Result<()> {
            self.0.insert(descriptor).await
        }
        async fn update(&self, descriptor: &ServerDescriptor) -> mcphub_store::Result<()> {
            self.0.update(descriptor).await
        }
        async fn delete(&self, _id: ServerId) -> mcphub_store::Result<bool> {
            Err(mcphub_store::StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only database",
            )))
        }
    }

    #[tokio::test]
    async fn test_failed_store_delete_leaves_server_running() {
        let factory = ScriptedFactory::new();
        factory.serve("weather", weather_server());
        let supervisor = Supervisor::new(
            &test_config(),
            Arc::new(UndeletableStore(MemoryServerStore::new())) as Arc<dyn ServerStore>,
            factory.clone() as Arc<dyn TransportFactory>,
            EventPublisher::detached(),
        );
        let descriptor = supervisor.create(weather()).await.unwrap();
        supervisor.connect(descriptor.id).await.unwrap();

        let err = supervisor.delete(descriptor.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        assert_eq!(supervisor.status(descriptor.id).unwrap().status, ServerStatus::Connected);
        assert!(supervisor.live_connection(descriptor.id).is_some());
        assert_eq!(supervisor.registry().find_tool_owner("get_forecast"), Some(descriptor.id));
        assert!(!factory.latest("weather").unwrap().is_closed());
    }
}
