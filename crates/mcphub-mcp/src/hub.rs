//! Wiring for a running hub.

use std::sync::Arc;

use mcphub_core::Config;
use mcphub_store::ServerStore;

use crate::error::McpError;
use crate::notifier::EventNotifier;
use crate::router::Router;
use crate::supervisor::Supervisor;
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// Notifier, supervisor and router assembled from one configuration.
pub struct Hub {
    pub notifier: EventNotifier,
    pub supervisor: Arc<Supervisor>,
    pub router: Router,
}

impl Hub {
    /// Assemble a hub with the default transports and initialize it.
    pub async fn start(config: &Config, store: Arc<dyn ServerStore>) -> Result<Self, McpError> {
        let factory = Arc::new(DefaultTransportFactory::new(config.supervisor.shutdown_grace()));
        Self::start_with(config, store, factory).await
    }

    /// Assemble a hub with a custom transport factory and initialize it.
    pub async fn start_with(
        config: &Config,
        store: Arc<dyn ServerStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, McpError> {
        let (notifier, publisher) = EventNotifier::start(config.supervisor.event_buffer);
        let supervisor = Supervisor::new(config, store, factory, publisher);
        supervisor.initialize().await?;

        let router = Router::new(Arc::clone(&supervisor)).with_scope(config.general.default_scope());
        Ok(Self {
            notifier,
            supervisor,
            router,
        })
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
