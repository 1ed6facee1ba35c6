//! In-memory descriptor store.

use std::collections::HashMap;

use async_trait::async_trait;
use mcphub_core::{Scope, ServerDescriptor, ServerId};
use parking_lot::RwLock;

use crate::{Result, ServerStore, StoreError};

/// Descriptor store that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryServerStore {
    servers: RwLock<HashMap<ServerId, ServerDescriptor>>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored descriptors.
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Lookup without going through the async trait.
    pub fn get_sync(&self, id: ServerId) -> Option<ServerDescriptor> {
        self.servers.read().get(&id).cloned()
    }

    fn sorted(mut servers: Vec<ServerDescriptor>) -> Vec<ServerDescriptor> {
        servers.sort_by(|a, b| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));
        servers
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn list(&self, scope: &Scope) -> Result<Vec<ServerDescriptor>> {
        let servers = self
            .servers
            .read()
            .values()
            .filter(|d| &d.scope == scope)
            .cloned()
            .collect();
        Ok(Self::sorted(servers))
    }

    async fn list_all(&self) -> Result<Vec<ServerDescriptor>> {
        Ok(Self::sorted(self.servers.read().values().cloned().collect()))
    }

    async fn get(&self, id: ServerId) -> Result<Option<ServerDescriptor>> {
        Ok(self.get_sync(id))
    }

    async fn find_by_name(&self, scope: &Scope, name: &str) -> Result<Option<ServerDescriptor>> {
        Ok(self
            .servers
            .read()
            .values()
            .find(|d| &d.scope == scope && d.name == name)
            .cloned())
    }

    async fn insert(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let mut servers = self.servers.write();
        let taken = servers.contains_key(&descriptor.id)
            || servers
                .values()
                .any(|d| d.scope == descriptor.scope && d.name == descriptor.name);
        if taken {
            return Err(StoreError::Duplicate {
                scope: descriptor.scope.to_string(),
                name: descriptor.name.clone(),
            });
        }
        servers.insert(descriptor.id, descriptor.clone());
        Ok(())
    }

    async fn update(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let mut servers = self.servers.write();
        if !servers.contains_key(&descriptor.id) {
            return Err(StoreError::NotFound(descriptor.id.to_string()));
        }
        let clash = servers
            .values()
            .any(|d| d.id != descriptor.id && d.scope == descriptor.scope && d.name == descriptor.name);
        if clash {
            return Err(StoreError::Duplicate {
                scope: descriptor.scope.to_string(),
                name: descriptor.name.clone(),
            });
        }
        servers.insert(descriptor.id, descriptor.clone());
        Ok(())
    }

    async fn delete(&self, id: ServerId) -> Result<bool> {
        Ok(self.servers.write().remove(&id).is_some())
    }
}
